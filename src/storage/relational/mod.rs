//! Relational store.
//!
//! [`RelationalClient`] runs statements inside transactions on pooled
//! connections and builds `INSERT`/`UPDATE`/`DELETE` statements from
//! column-to-value [`Record`]s. [`PostgresConnector`] (feature `postgres`)
//! talks to PostgreSQL; [`InMemorySqlStore`] stands in for it in tests.

pub mod builder;
mod client;
mod memory;
mod postgres;
mod session;

pub use builder::{DEFAULT_PAGE_SIZE, Statement};
pub use client::{RelationalClient, TransactionScope};
pub use memory::{InMemorySqlSession, InMemorySqlStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConnector, PostgresSession};
pub use session::{Record, Row, SqlSession, SqlValue};
