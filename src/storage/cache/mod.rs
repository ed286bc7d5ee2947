//! Cache.
//!
//! [`CacheClient`] stores text values (numbers and other scalars are coerced
//! through [`CacheText`]) and runs list-backed FIFO queues. [`RedisConnector`]
//! (feature `redis`) talks to Redis; [`InMemoryCache`] stands in for it in
//! tests.

mod client;
mod memory;
mod redis;
mod session;

pub use client::CacheClient;
pub use memory::{InMemoryCache, InMemoryCacheSession};
#[cfg(feature = "redis")]
pub use redis::{RedisConnector, RedisSession, connection_url, escape_glob};
pub use session::{CacheSession, CacheText};
