//! Metric names and descriptions.
//!
//! Metrics are recorded through the `metrics` facade. No exporter is
//! installed here; an embedding application installs its own recorder and
//! the counters below show up in it.

/// Pool acquisitions, labelled by `backend` and `status`.
pub const POOL_ACQUIRE_TOTAL: &str = "pool_acquire_total";
/// Slot reconnects, labelled by `backend` and `status`.
pub const POOL_RECONNECT_TOTAL: &str = "pool_reconnect_total";
/// Failed connection attempts while filling a pool, labelled by `backend`.
pub const POOL_CONNECT_FAILURES_TOTAL: &str = "pool_connect_failures_total";
/// Idle slots, labelled by `backend`.
pub const POOL_AVAILABLE_SLOTS: &str = "pool_available_slots";
/// Retry outcomes, labelled by `backend`, `operation` and `outcome`.
pub const STORAGE_RETRY_TOTAL: &str = "storage_retry_total";

/// Registers descriptions for every metric with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(POOL_ACQUIRE_TOTAL, "Connection pool acquisitions");
    metrics::describe_counter!(POOL_RECONNECT_TOTAL, "Pooled connection reconnects");
    metrics::describe_counter!(
        POOL_CONNECT_FAILURES_TOTAL,
        "Failed attempts to create pooled connections"
    );
    metrics::describe_gauge!(POOL_AVAILABLE_SLOTS, "Idle connections in the pool");
    metrics::describe_counter!(
        STORAGE_RETRY_TOTAL,
        "Outcomes of retried storage operations"
    );
}
