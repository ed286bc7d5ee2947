//! Storage layer.
//!
//! Two shared primitives and the three store clients built on them:
//! - **Pool**: [`ResilientPool`] of pre-established connections with lazy
//!   liveness probing and a strict capacity cap
//! - **Retry**: [`RetryingOperation`] reconnects a failed slot and retries once
//! - **Clients**: vector (Milvus), relational (PostgreSQL) and cache (Redis),
//!   each reached through a [`Connector`] so in-memory stores can stand in

// Allow significant_drop_tightening - slot guards are held for the whole unit of work.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit error-kind handling.
#![allow(clippy::match_same_arms)]
// Allow module_name_repetitions for client and session type names.
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod faults;
pub mod lifecycle;
pub mod pool;
pub mod relational;
pub mod resilience;
pub mod vector;

pub use faults::FaultInjector;
pub use lifecycle::ProcessHandle;
pub use pool::{Connector, PoolConfig, PoolStatus, PooledSlot, ResilientPool, SlotId};
pub use resilience::{BoundedRetry, RetryingOperation};
