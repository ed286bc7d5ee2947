//! Fault injection for the in-memory connectors.
//!
//! A [`FaultInjector`] is shared (behind an `Arc`) between a test and the
//! in-memory connector it drives. Each counter arms the next `n` calls of one
//! kind to fail with a transient [`Error::Connection`].

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Armed failures and call counters for an in-memory backend.
#[derive(Debug, Default)]
pub struct FaultInjector {
    unreachable: AtomicBool,
    failing_connects: AtomicUsize,
    failing_operations: AtomicUsize,
    failing_probes: AtomicUsize,
    delayed_operation_failure: AtomicUsize,
    connects: AtomicUsize,
    operations: AtomicUsize,
    probes: AtomicUsize,
}

impl FaultInjector {
    /// Creates an injector with nothing armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connect fail until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fails the next `n` connects.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Fails the next `n` operations with a transient error.
    pub fn fail_next_operations(&self, n: usize) {
        self.failing_operations.store(n, Ordering::SeqCst);
    }

    /// Lets the next `skip` operations through, then fails one.
    pub fn fail_operation_after(&self, skip: usize) {
        self.delayed_operation_failure
            .store(skip.saturating_add(1), Ordering::SeqCst);
    }

    /// Fails the next `n` liveness probes.
    pub fn fail_next_probes(&self, n: usize) {
        self.failing_probes.store(n, Ordering::SeqCst);
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Operations attempted so far, failed ones included.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// Probes attempted so far.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Called by connectors on connect.
    ///
    /// # Errors
    ///
    /// Returns a connection error when a connect failure is armed.
    pub fn on_connect(&self, backend: &'static str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) || take_one(&self.failing_connects) {
            return Err(Error::Connection {
                backend,
                cause: "connection refused (injected)".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Called by connectors before every operation.
    ///
    /// # Errors
    ///
    /// Returns a connection error when an operation failure is armed.
    pub fn on_operation(&self, backend: &'static str) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        let delayed = self
            .delayed_operation_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|n| n == 1);
        if delayed || take_one(&self.failing_operations) {
            return Err(Error::Connection {
                backend,
                cause: "connection reset by peer (injected)".to_string(),
            });
        }
        Ok(())
    }

    /// Called by connectors on probe.
    ///
    /// # Errors
    ///
    /// Returns a connection error when a probe failure is armed.
    pub fn on_probe(&self, backend: &'static str) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_probes) {
            return Err(Error::Connection {
                backend,
                cause: "probe timed out (injected)".to_string(),
            });
        }
        Ok(())
    }
}

/// Decrements an armed counter, returning `true` if a failure was consumed.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_armed_failures_are_consumed() {
        let faults = FaultInjector::new();
        faults.fail_next_operations(2);
        assert!(faults.on_operation("test").is_err());
        assert!(faults.on_operation("test").is_err());
        assert!(faults.on_operation("test").is_ok());
        assert_eq!(faults.operation_count(), 3);
    }

    #[test]
    fn test_unreachable_fails_every_connect() {
        let faults = FaultInjector::new();
        faults.set_unreachable(true);
        assert!(faults.on_connect("test").is_err());
        assert!(faults.on_connect("test").is_err());
        faults.set_unreachable(false);
        assert!(faults.on_connect("test").is_ok());
        assert_eq!(faults.connect_count(), 1);
    }

    #[test]
    fn test_delayed_operation_failure() {
        let faults = FaultInjector::new();
        faults.fail_operation_after(2);
        assert!(faults.on_operation("test").is_ok());
        assert!(faults.on_operation("test").is_ok());
        assert!(faults.on_operation("test").is_err());
        assert!(faults.on_operation("test").is_ok());
    }
}
