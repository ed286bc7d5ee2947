//! Reconnect-and-retry discipline around pooled operations.
//!
//! Every store operation goes through [`RetryingOperation::run`]:
//!
//! ```text
//! acquire --> work --> Ok ------------------------------------> release
//!               |
//!               +--> Err(kind)
//!                     Transient : reconnect --> work (once) --> release
//!                     Fatal     : reconnect --> re-raise    --> release
//!                     Domain    : ----------------------------> release
//!                     Caller    : ----------------------------> release
//! ```
//!
//! The release is the slot guard's `Drop`, so it happens exactly once on every
//! path, including panics inside `work`.
//!
//! Non-idempotent writes use [`RetryingOperation::run_once`] instead: a
//! transient failure reconnects the slot and is re-raised without replaying
//! the work.
//!
//! # Usage
//!
//! ```rust,ignore
//! use stowage::storage::{ResilientPool, RetryingOperation};
//!
//! let pool = ResilientPool::new(connector, config);
//! let rows = RetryingOperation::new(&pool, "query").run(|conn| conn.query(sql, &[]))?;
//! ```

use super::pool::{Connector, ResilientPool};
use crate::config::StoreSettings;
use crate::{ErrorKind, Result};
use std::time::Duration;

/// One unit of work run against a pooled connection with a single
/// reconnect-and-retry on transient failure.
pub struct RetryingOperation<'p, C: Connector> {
    pool: &'p ResilientPool<C>,
    operation: &'static str,
}

impl<'p, C: Connector> RetryingOperation<'p, C> {
    /// Creates an operation bound to a pool. `operation` labels logs and metrics.
    #[must_use]
    pub const fn new(pool: &'p ResilientPool<C>, operation: &'static str) -> Self {
        Self { pool, operation }
    }

    /// Runs `work` against a pooled connection.
    ///
    /// `work` is invoked at most twice. A transient failure reconnects the slot
    /// and retries once; if the reconnect itself fails, its error is returned
    /// and `work` is not invoked again. Fatal failures reconnect the slot and
    /// are re-raised. Domain and caller failures are returned untouched.
    ///
    /// # Errors
    ///
    /// Returns the acquire error, the reconnect error, or the work's error.
    pub fn run<T, F>(&self, mut work: F) -> Result<T>
    where
        F: FnMut(&mut C::Connection) -> Result<T>,
    {
        let backend = self.pool.backend_name();
        let mut slot = self.pool.acquire()?;

        let err = match slot.with(&mut work) {
            Ok(value) => {
                self.record("ok");
                return Ok(value);
            },
            Err(e) => e,
        };

        match err.kind() {
            ErrorKind::Transient => {
                tracing::warn!(
                    backend,
                    operation = self.operation,
                    slot = slot.id(),
                    error = %err,
                    "Operation failed, reconnecting and retrying once"
                );
                if let Err(reconnect_err) = self.pool.reconnect(&mut slot) {
                    self.record("reconnect_failed");
                    return Err(reconnect_err);
                }
                match slot.with(&mut work) {
                    Ok(value) => {
                        self.record("retried_ok");
                        Ok(value)
                    },
                    Err(retry_err) => {
                        tracing::error!(
                            backend,
                            operation = self.operation,
                            slot = slot.id(),
                            error = %retry_err,
                            "Operation failed after retry"
                        );
                        self.record("retried_error");
                        Err(retry_err)
                    },
                }
            },
            ErrorKind::Fatal => {
                tracing::error!(
                    backend,
                    operation = self.operation,
                    slot = slot.id(),
                    error = %err,
                    "Operation failed unexpectedly, reconnecting slot"
                );
                if let Err(reconnect_err) = self.pool.reconnect(&mut slot) {
                    tracing::warn!(
                        backend,
                        operation = self.operation,
                        error = %reconnect_err,
                        "Reconnect after unexpected failure also failed"
                    );
                }
                self.record("fatal");
                Err(err)
            },
            ErrorKind::Domain | ErrorKind::Caller => {
                tracing::debug!(
                    backend,
                    operation = self.operation,
                    error = %err,
                    "Operation rejected"
                );
                self.record("rejected");
                Err(err)
            },
        }
    }

    /// Runs non-idempotent `work` exactly once.
    ///
    /// Transient and fatal failures reconnect the slot and are re-raised;
    /// `work` is never replayed, so partial writes are not repeated. Domain
    /// and caller failures are returned untouched.
    ///
    /// # Errors
    ///
    /// Returns the acquire error or the work's error.
    pub fn run_once<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&mut C::Connection) -> Result<T>,
    {
        let backend = self.pool.backend_name();
        let mut slot = self.pool.acquire()?;

        let err = match slot.with(work) {
            Ok(value) => {
                self.record("ok");
                return Ok(value);
            },
            Err(e) => e,
        };

        match err.kind() {
            ErrorKind::Transient | ErrorKind::Fatal => {
                tracing::error!(
                    backend,
                    operation = self.operation,
                    slot = slot.id(),
                    error = %err,
                    "Write failed, reconnecting slot without replay"
                );
                if let Err(reconnect_err) = self.pool.reconnect(&mut slot) {
                    tracing::warn!(
                        backend,
                        operation = self.operation,
                        error = %reconnect_err,
                        "Reconnect after failed write also failed"
                    );
                }
                self.record("failed_no_replay");
                Err(err)
            },
            ErrorKind::Domain | ErrorKind::Caller => {
                tracing::debug!(
                    backend,
                    operation = self.operation,
                    error = %err,
                    "Operation rejected"
                );
                self.record("rejected");
                Err(err)
            },
        }
    }

    fn record(&self, outcome: &'static str) {
        metrics::counter!(
            "storage_retry_total",
            "backend" => self.pool.backend_name(),
            "operation" => self.operation,
            "outcome" => outcome
        )
        .increment(1);
    }
}

impl<C: Connector> ResilientPool<C> {
    /// Shorthand for `RetryingOperation::new(self, operation).run(work)`.
    ///
    /// # Errors
    ///
    /// See [`RetryingOperation::run`].
    pub fn run<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: FnMut(&mut C::Connection) -> Result<T>,
    {
        RetryingOperation::new(self, operation).run(work)
    }

    /// Shorthand for `RetryingOperation::new(self, operation).run_once(work)`.
    ///
    /// # Errors
    ///
    /// See [`RetryingOperation::run_once`].
    pub fn run_once<T, F>(&self, operation: &'static str, work: F) -> Result<T>
    where
        F: FnOnce(&mut C::Connection) -> Result<T>,
    {
        RetryingOperation::new(self, operation).run_once(work)
    }
}

/// Fixed-delay retry for read paths: up to `attempts` tries on one slot,
/// reconnecting between tries. Only transient failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedRetry {
    attempts: u32,
    delay: Duration,
}

impl Default for BoundedRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl BoundedRetry {
    /// Creates a retry policy. `attempts` is clamped to at least one.
    #[must_use]
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            delay,
        }
    }

    /// Builds the policy from `retry_count` and `retry_delay`.
    #[must_use]
    pub const fn from_settings(settings: &StoreSettings) -> Self {
        Self::new(settings.retry_count, settings.retry_delay)
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `work`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the acquire error, a non-transient error, or the last transient
    /// error once attempts are exhausted.
    pub fn run<C, T, F>(&self, pool: &ResilientPool<C>, operation: &'static str, mut work: F) -> Result<T>
    where
        C: Connector,
        F: FnMut(&mut C::Connection) -> Result<T>,
    {
        let backend = pool.backend_name();
        let mut slot = pool.acquire()?;
        let mut attempt = 1;

        loop {
            match slot.with(&mut work) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        backend,
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Read failed, retrying"
                    );
                    metrics::counter!(
                        "storage_retry_total",
                        "backend" => backend,
                        "operation" => operation,
                        "outcome" => "bounded_retry"
                    )
                    .increment(1);
                    std::thread::sleep(self.delay);
                    // A failed reconnect leaves the slot dead; the next attempt
                    // then fails fast with a transient error.
                    if let Err(reconnect_err) = pool.reconnect(&mut slot) {
                        tracing::debug!(
                            backend,
                            operation,
                            attempt,
                            error = %reconnect_err,
                            "Reconnect between read attempts failed"
                        );
                    }
                    attempt += 1;
                },
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(
                            backend,
                            operation,
                            attempts = attempt,
                            error = %e,
                            "Read failed after all retries"
                        );
                    }
                    return Err(e);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PoolConfig;
    use crate::{Error, SlotId};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        refuse: AtomicBool,
    }

    impl Connector for CountingConnector {
        type Connection = SlotId;

        fn backend_name(&self) -> &'static str {
            "test"
        }

        fn connect(&self, slot: SlotId) -> Result<SlotId> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(Error::Connection {
                    backend: "test",
                    cause: "reconnect refused".to_string(),
                });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(slot)
        }

        fn probe(&self, _conn: &mut SlotId) -> Result<()> {
            Ok(())
        }
    }

    fn pool() -> ResilientPool<CountingConnector> {
        ResilientPool::new(CountingConnector::default(), PoolConfig::with_capacity(1))
    }

    fn transient() -> Error {
        Error::Connection {
            backend: "test",
            cause: "broken pipe".to_string(),
        }
    }

    fn connects(pool: &ResilientPool<CountingConnector>) -> usize {
        pool.connector().connects.load(Ordering::SeqCst)
    }

    #[test]
    fn test_success_runs_once_without_reconnect() {
        let pool = pool();
        let mut calls = 0;
        let value = pool
            .run("op", |_| {
                calls += 1;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls, 1);
        assert_eq!(connects(&pool), 1);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_transient_failure_reconnects_and_retries_once() {
        let pool = pool();
        let mut calls = 0;
        let value = pool
            .run("op", |_| {
                calls += 1;
                if calls == 1 { Err(transient()) } else { Ok("second") }
            })
            .unwrap();
        assert_eq!(value, "second");
        assert_eq!(calls, 2);
        assert_eq!(connects(&pool), 2);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_second_failure_propagates() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = pool.run("op", |_| {
            calls += 1;
            Err(transient())
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_failed_reconnect_skips_second_attempt() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = pool.run("op", |_| {
            calls += 1;
            pool.connector().refuse.store(true, Ordering::SeqCst);
            Err(transient())
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("reconnect refused"));
        assert_eq!(calls, 1);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_fatal_failure_reconnects_and_reraises() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = pool.run("op", |_| {
            calls += 1;
            Err(Error::OperationFailed {
                operation: "op".to_string(),
                cause: "unexpected".to_string(),
            })
        });
        assert!(matches!(result, Err(Error::OperationFailed { .. })));
        assert_eq!(calls, 1);
        assert_eq!(connects(&pool), 2);
    }

    #[test]
    fn test_domain_and_caller_failures_are_returned_untouched() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = pool.run("op", |_| {
            calls += 1;
            Err(Error::Backend {
                backend: "test",
                code: Some(1),
                message: "no such table".to_string(),
            })
        });
        assert_eq!(result.unwrap_err().backend_code(), Some(1));

        let result: Result<()> = pool.run("op", |_| {
            calls += 1;
            Err(Error::InvalidInput("bad".to_string()))
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(calls, 2);
        assert_eq!(connects(&pool), 1);
    }

    #[test]
    fn test_bounded_retry_recovers_within_attempts() {
        let pool = pool();
        let mut calls = 0;
        let value = BoundedRetry::new(3, Duration::ZERO)
            .run(&pool, "get", |_| {
                calls += 1;
                if calls < 3 { Err(transient()) } else { Ok(calls) }
            })
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(connects(&pool), 3);
    }

    #[test]
    fn test_bounded_retry_gives_up_after_attempts() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = BoundedRetry::new(2, Duration::ZERO).run(&pool, "get", |_| {
            calls += 1;
            Err(transient())
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_bounded_retry_ignores_domain_errors() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = BoundedRetry::default().run(&pool, "get", |_| {
            calls += 1;
            Err(Error::Backend {
                backend: "test",
                code: None,
                message: "WRONGTYPE".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        assert_eq!(BoundedRetry::new(0, Duration::ZERO).attempts(), 1);
    }

    #[test]
    fn test_run_once_transient_reconnects_without_replay() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = pool.run_once("insert", |_| {
            calls += 1;
            Err(transient())
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 1);
        assert_eq!(connects(&pool), 2);
        assert_eq!(pool.status().available, 1);
    }

    #[test]
    fn test_run_once_domain_failure_keeps_connection() {
        let pool = pool();
        let result: Result<()> = pool.run_once("insert", |_| {
            Err(Error::Backend {
                backend: "test",
                code: Some(65535),
                message: "rejected".to_string(),
            })
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Domain);
        assert_eq!(connects(&pool), 1);
    }

    #[test]
    fn test_bounded_retry_with_failed_reconnect_fails_fast() {
        let pool = pool();
        let mut calls = 0;
        let result: Result<()> = BoundedRetry::new(2, Duration::ZERO).run(&pool, "get", |_| {
            calls += 1;
            pool.connector().refuse.store(true, Ordering::SeqCst);
            Err(transient())
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 1);
    }
}
