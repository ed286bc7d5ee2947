//! Resilient connection pool.
//!
//! A fixed-capacity table of pre-established connections shared by every
//! store client. The pool owns every connection it creates; callers borrow one
//! through a [`PooledSlot`] guard, which returns it on drop.
//!
//! # Slot lifecycle
//!
//! ```text
//!   reserve (under lock) --> connect (no lock) --> available
//!        ^                                            |  acquire: pop + probe
//!        |  pool empty, below capacity                v
//!        +------------------------------------ outstanding
//!                                                     |  drop(PooledSlot)
//!                                   available <-------+
//! ```
//!
//! Only the pop/push bookkeeping runs under the pool mutex. Connecting,
//! probing and reconnecting always happen with the lock released, so a slow
//! backend never serializes unrelated callers.
//!
//! # Capacity
//!
//! Growth is strictly capped at `max_size`: slot ids are reserved under the
//! lock before any connection attempt, so concurrent creators never overshoot.
//! When every slot is outstanding, `acquire` waits for a release, bounded by
//! `acquire_timeout`, and then fails with [`Error::PoolExhausted`].

use crate::config::StoreSettings;
use crate::{Error, Result};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Identifier of a pooled slot, stable across reconnects.
pub type SlotId = usize;

/// Creates, probes and tears down backend connections for a pool.
///
/// Implementations exist for Milvus, PostgreSQL and Redis, plus in-memory
/// stand-ins used by tests.
pub trait Connector: Send + Sync {
    /// The live connection handle stored in each slot.
    type Connection: Send;

    /// Short backend name used in logs, metrics and errors.
    fn backend_name(&self) -> &'static str;

    /// Establishes a connection for the given slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn connect(&self, slot: SlotId) -> Result<Self::Connection>;

    /// Cheap liveness check (a no-op backend call).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is no longer usable.
    fn probe(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Tears a connection down. Dropping it is enough for most backends.
    fn disconnect(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Pool sizing and health-check configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections created when the pool is constructed.
    pub min_size: usize,
    /// Hard cap on connections the pool will ever hold.
    pub max_size: usize,
    /// How long `acquire` waits for a release when every slot is outstanding.
    pub acquire_timeout: Duration,
    /// Slots idle for at least this long are probed before being handed out.
    ///
    /// Zero probes on every acquisition.
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 10,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            health_check_interval: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with `min_size == max_size == capacity`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            min_size: capacity,
            max_size: capacity,
            ..Self::default()
        }
    }

    /// Derives a pool configuration from store settings.
    #[must_use]
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            min_size: settings.pool_min_size,
            max_size: settings.pool_max_size,
            acquire_timeout: settings.acquire_timeout,
            health_check_interval: settings.health_check_interval,
        }
        .normalized()
    }

    /// Sets the number of connections created at construction.
    #[must_use]
    pub const fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the health-check interval.
    #[must_use]
    pub const fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Clamps `max_size` to at least one and `min_size` to at most `max_size`.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.min_size = self.min_size.min(self.max_size);
        self
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured maximum size.
    pub capacity: usize,
    /// Slots waiting in the pool.
    pub available: usize,
    /// Slots currently held by callers.
    pub outstanding: usize,
    /// Slots reserved and being connected.
    pub pending: usize,
    /// Whether the pool has been closed.
    pub closed: bool,
}

impl PoolStatus {
    /// Slots that exist right now (available plus outstanding).
    #[must_use]
    pub const fn constructed(&self) -> usize {
        self.available + self.outstanding
    }
}

/// A slot sitting in the pool.
struct IdleSlot<T> {
    id: SlotId,
    /// `None` when the last reconnect failed; repaired on the next acquire.
    conn: Option<T>,
    idle_since: Instant,
}

struct PoolState<T> {
    available: Vec<IdleSlot<T>>,
    outstanding: HashSet<SlotId>,
    pending: HashSet<SlotId>,
    closed: bool,
}

impl<T> PoolState<T> {
    fn new() -> Self {
        Self {
            available: Vec::new(),
            outstanding: HashSet::new(),
            pending: HashSet::new(),
            closed: false,
        }
    }

    fn is_known(&self, id: SlotId) -> bool {
        self.outstanding.contains(&id)
            || self.pending.contains(&id)
            || self.available.iter().any(|slot| slot.id == id)
    }

    /// Reserves slot ids until constructed + pending reaches `target`.
    fn reserve(&mut self, target: usize, capacity: usize) -> Vec<SlotId> {
        let target = target.min(capacity);
        let mut existing = self.available.len() + self.outstanding.len() + self.pending.len();
        let mut reserved = Vec::new();
        for id in 0..capacity {
            if existing >= target {
                break;
            }
            if !self.is_known(id) {
                self.pending.insert(id);
                reserved.push(id);
                existing += 1;
            }
        }
        reserved
    }
}

/// Fixed-capacity pool of backend connections.
pub struct ResilientPool<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Connection>>,
    returned: Condvar,
}

impl<C: Connector> ResilientPool<C> {
    /// Creates a pool and eagerly connects `min_size` slots.
    ///
    /// Construction is best-effort: slots that fail to connect are logged and
    /// left out, and the pool runs under capacity until an `acquire` finds it
    /// empty.
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let pool = Self {
            connector,
            config: config.normalized(),
            state: Mutex::new(PoolState::new()),
            returned: Condvar::new(),
        };
        let created = pool.initialize(pool.config.min_size);
        tracing::info!(
            backend = pool.backend_name(),
            created,
            requested = pool.config.min_size,
            capacity = pool.config.max_size,
            "Connection pool initialized"
        );
        pool
    }

    /// Returns the connector.
    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the effective configuration.
    #[must_use]
    pub const fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the backend name.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.connector.backend_name()
    }

    /// Connects slots until `target` exist (capped at `max_size`).
    ///
    /// Returns the number of connections created. Failures are logged and
    /// skipped.
    pub fn initialize(&self, target: usize) -> usize {
        let reserved = {
            let mut state = self.lock_state();
            if state.closed {
                return 0;
            }
            state.reserve(target, self.config.max_size)
        };
        self.populate(&reserved).0
    }

    /// Takes a slot out of the pool.
    ///
    /// Pops an available slot, or creates the missing slots inline when the
    /// pool is empty and below capacity. The slot is probed if it has been
    /// idle for at least the health-check interval and reconnected if the
    /// probe fails.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the pool is empty and no connection could be
    ///   created, or if repairing a dead slot fails (the slot is returned to
    ///   the pool first)
    /// - [`Error::PoolExhausted`] if every slot stayed outstanding for the
    ///   whole acquire timeout
    /// - [`Error::Lifecycle`] if the pool has been closed
    pub fn acquire(&self) -> Result<PooledSlot<'_, C>> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut state = self.lock_state();

        loop {
            if state.closed {
                return Err(self.closed_error());
            }

            if let Some(idle) = state.available.pop() {
                state.outstanding.insert(idle.id);
                self.record_available(state.available.len());
                drop(state);

                let mut slot = PooledSlot {
                    pool: self,
                    id: idle.id,
                    conn: idle.conn,
                    idle_since: idle.idle_since,
                };
                if let Err(e) = self.verify(&mut slot) {
                    self.record_acquire("repair_failed");
                    return Err(e);
                }
                self.record_acquire("ok");
                return Ok(slot);
            }

            let reserved = state.reserve(self.config.max_size, self.config.max_size);
            if !reserved.is_empty() {
                drop(state);
                tracing::debug!(
                    backend = self.backend_name(),
                    slots = reserved.len(),
                    "Pool empty, creating connections inline"
                );
                let (created, last_error) = self.populate(&reserved);
                if created == 0 {
                    self.record_acquire("connect_failed");
                    return Err(last_error.unwrap_or_else(|| self.closed_error()));
                }
                state = self.lock_state();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                drop(state);
                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(
                    backend = self.backend_name(),
                    waited_ms,
                    capacity = self.config.max_size,
                    "Connection pool exhausted"
                );
                self.record_acquire("exhausted");
                return Err(Error::PoolExhausted {
                    backend: self.backend_name(),
                    waited_ms,
                });
            }

            let (guard, _) = self
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Returns a slot to the pool. Equivalent to dropping the guard.
    pub fn release(&self, slot: PooledSlot<'_, C>) {
        drop(slot);
    }

    /// Disconnects and reconnects the slot's connection under the same id.
    ///
    /// Failures are logged and returned; the slot is left without a connection
    /// and is repaired on a later acquire.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the new connection cannot be made.
    pub fn reconnect(&self, slot: &mut PooledSlot<'_, C>) -> Result<()> {
        if let Some(old) = slot.conn.take() {
            self.connector.disconnect(old);
        }

        match self.connector.connect(slot.id) {
            Ok(conn) => {
                slot.conn = Some(conn);
                tracing::info!(
                    backend = self.backend_name(),
                    slot = slot.id,
                    "Reconnected pooled connection"
                );
                self.record_reconnect("ok");
                Ok(())
            },
            Err(e) => {
                tracing::error!(
                    backend = self.backend_name(),
                    slot = slot.id,
                    error = %e,
                    "Failed to reconnect pooled connection"
                );
                self.record_reconnect("error");
                Err(e)
            },
        }
    }

    /// Closes the pool: idle slots are disconnected now, outstanding slots
    /// when they are returned. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.available)
        };

        let count = drained.len();
        for idle in drained {
            if let Some(conn) = idle.conn {
                self.connector.disconnect(conn);
            }
        }
        self.returned.notify_all();
        self.record_available(0);
        tracing::info!(
            backend = self.backend_name(),
            disconnected = count,
            "Connection pool closed"
        );
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Returns a snapshot of pool occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.lock_state();
        PoolStatus {
            capacity: self.config.max_size,
            available: state.available.len(),
            outstanding: state.outstanding.len(),
            pending: state.pending.len(),
            closed: state.closed,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects the reserved ids outside the lock, then publishes the
    /// successes and clears the reservations.
    fn populate(&self, reserved: &[SlotId]) -> (usize, Option<Error>) {
        if reserved.is_empty() {
            return (0, None);
        }

        let mut created = Vec::with_capacity(reserved.len());
        let mut last_error = None;
        for &id in reserved {
            match self.connector.connect(id) {
                Ok(conn) => created.push(IdleSlot {
                    id,
                    conn: Some(conn),
                    idle_since: Instant::now(),
                }),
                Err(e) => {
                    tracing::error!(
                        backend = self.backend_name(),
                        slot = id,
                        error = %e,
                        "Failed to create pooled connection"
                    );
                    metrics::counter!(
                        "pool_connect_failures_total",
                        "backend" => self.backend_name()
                    )
                    .increment(1);
                    last_error = Some(e);
                },
            }
        }

        let mut state = self.lock_state();
        for id in reserved {
            state.pending.remove(id);
        }

        if state.closed {
            drop(state);
            for idle in created {
                if let Some(conn) = idle.conn {
                    self.connector.disconnect(conn);
                }
            }
            self.returned.notify_all();
            return (0, last_error);
        }

        let count = created.len();
        state.available.extend(created);
        self.record_available(state.available.len());
        drop(state);
        self.returned.notify_all();
        (count, last_error)
    }

    /// Repairs a dead slot or probes an idle one.
    fn verify(&self, slot: &mut PooledSlot<'_, C>) -> Result<()> {
        let Some(conn) = slot.conn.as_mut() else {
            tracing::debug!(
                backend = self.backend_name(),
                slot = slot.id,
                "Slot has no connection, reconnecting"
            );
            return self.reconnect(slot);
        };

        if slot.idle_since.elapsed() < self.config.health_check_interval {
            return Ok(());
        }

        if let Err(e) = self.connector.probe(conn) {
            tracing::warn!(
                backend = self.backend_name(),
                slot = slot.id,
                error = %e,
                "Liveness probe failed, reconnecting"
            );
            return self.reconnect(slot);
        }
        Ok(())
    }

    /// Returns a slot to the available set. A slot id already present is
    /// left alone.
    fn release_slot(&self, id: SlotId, conn: Option<C::Connection>) {
        let mut state = self.lock_state();
        state.outstanding.remove(&id);

        if state.closed {
            drop(state);
            if let Some(conn) = conn {
                self.connector.disconnect(conn);
            }
            self.returned.notify_all();
            return;
        }

        if state.available.iter().any(|slot| slot.id == id) {
            drop(state);
            tracing::debug!(
                backend = self.backend_name(),
                slot = id,
                "Slot already released"
            );
            if let Some(conn) = conn {
                self.connector.disconnect(conn);
            }
            return;
        }

        state.available.push(IdleSlot {
            id,
            conn,
            idle_since: Instant::now(),
        });
        self.record_available(state.available.len());
        drop(state);
        self.returned.notify_one();
    }

    fn closed_error(&self) -> Error {
        Error::Lifecycle(format!("{} connection pool is closed", self.backend_name()))
    }

    fn record_acquire(&self, status: &'static str) {
        metrics::counter!(
            "pool_acquire_total",
            "backend" => self.backend_name(),
            "status" => status
        )
        .increment(1);
    }

    fn record_reconnect(&self, status: &'static str) {
        metrics::counter!(
            "pool_reconnect_total",
            "backend" => self.backend_name(),
            "status" => status
        )
        .increment(1);
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_available(&self, available: usize) {
        metrics::gauge!(
            "pool_available_slots",
            "backend" => self.backend_name()
        )
        .set(available as f64);
    }
}

/// A slot checked out of a [`ResilientPool`].
///
/// The holder has exclusive use of the connection until the guard is dropped,
/// at which point the slot goes back to the pool exactly once.
pub struct PooledSlot<'a, C: Connector> {
    pool: &'a ResilientPool<C>,
    id: SlotId,
    conn: Option<C::Connection>,
    idle_since: Instant,
}

impl<C: Connector> PooledSlot<'_, C> {
    /// Returns the slot id.
    #[must_use]
    pub const fn id(&self) -> SlotId {
        self.id
    }

    /// Returns `true` if the slot currently holds a connection.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the last reconnect failed.
    pub fn connection(&mut self) -> Result<&mut C::Connection> {
        let backend = self.pool.backend_name();
        let id = self.id;
        self.conn.as_mut().ok_or_else(|| Error::Connection {
            backend,
            cause: format!("slot {id} has no live connection"),
        })
    }

    /// Runs `work` against the live connection.
    ///
    /// # Errors
    ///
    /// Returns the work's error, or [`Error::Connection`] for a dead slot.
    pub fn with<T>(&mut self, work: impl FnOnce(&mut C::Connection) -> Result<T>) -> Result<T> {
        work(self.connection()?)
    }
}

impl<C: Connector> Drop for PooledSlot<'_, C> {
    fn drop(&mut self) {
        self.pool.release_slot(self.id, self.conn.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct TestConnector {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        probes: AtomicUsize,
        failing_ids: Mutex<HashSet<SlotId>>,
        fail_all: AtomicBool,
        probe_fails: AtomicBool,
    }

    impl TestConnector {
        fn failing(ids: &[SlotId]) -> Self {
            let connector = Self::default();
            connector
                .failing_ids
                .lock()
                .unwrap()
                .extend(ids.iter().copied());
            connector
        }
    }

    impl Connector for TestConnector {
        type Connection = SlotId;

        fn backend_name(&self) -> &'static str {
            "test"
        }

        fn connect(&self, slot: SlotId) -> Result<SlotId> {
            if self.fail_all.load(Ordering::SeqCst) || self.failing_ids.lock().unwrap().contains(&slot)
            {
                return Err(Error::Connection {
                    backend: "test",
                    cause: "refused".to_string(),
                });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(slot)
        }

        fn probe(&self, _conn: &mut SlotId) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_fails.load(Ordering::SeqCst) {
                return Err(Error::Connection {
                    backend: "test",
                    cause: "broken pipe".to_string(),
                });
            }
            Ok(())
        }

        fn disconnect(&self, _conn: SlotId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_size: min,
            max_size: max,
            acquire_timeout: Duration::from_millis(50),
            health_check_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_new_creates_min_size_connections() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(3, 5));
        let status = pool.status();
        assert_eq!(status.available, 3);
        assert_eq!(status.outstanding, 0);
        assert_eq!(status.capacity, 5);
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_initialization_is_best_effort() {
        let pool = ResilientPool::new(TestConnector::failing(&[1, 3]), quick_config(5, 5));
        assert_eq!(pool.status().available, 3);
    }

    #[test]
    fn test_released_slot_is_immediately_reacquirable() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(1, 1));
        let slot = pool.acquire().unwrap();
        let id = slot.id();
        assert_eq!(pool.status().available, 0);
        pool.release(slot);
        assert_eq!(pool.status().available, 1);

        let again = pool.acquire().unwrap();
        assert_eq!(again.id(), id);
    }

    #[test]
    fn test_empty_pool_grows_up_to_capacity() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(1, 3));
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        let ids: HashSet<_> = [a.id(), b.id(), c.id()].into_iter().collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(pool.status().outstanding, 3);
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_acquire_times_out_when_exhausted() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(1, 1));
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().err().unwrap();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let config = quick_config(1, 1).with_acquire_timeout(Duration::from_secs(5));
        let pool = Arc::new(ResilientPool::new(TestConnector::default(), config));
        let holder = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let slot = pool.acquire().unwrap();
                thread::sleep(Duration::from_millis(30));
                drop(slot);
            })
        };
        thread::sleep(Duration::from_millis(5));
        let slot = pool.acquire();
        assert!(slot.is_ok());
        drop(slot);
        holder.join().unwrap();
    }

    #[test]
    fn test_failed_probe_triggers_reconnect() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(1, 1));
        pool.connector().probe_fails.store(true, Ordering::SeqCst);

        let slot = pool.acquire().unwrap();
        assert!(slot.is_connected());
        assert_eq!(pool.connector().connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recently_used_slot_skips_probe() {
        let config = quick_config(1, 1).with_health_check_interval(Duration::from_secs(3600));
        let pool = ResilientPool::new(TestConnector::default(), config);
        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());
        assert_eq!(pool.connector().probes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_reconnect_returns_slot_and_surfaces_error() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(1, 1));
        let mut slot = pool.acquire().unwrap();
        pool.connector().fail_all.store(true, Ordering::SeqCst);

        assert!(pool.reconnect(&mut slot).is_err());
        assert!(!slot.is_connected());
        assert!(slot.connection().is_err());
        drop(slot);

        // The dead slot is back in the pool; repairing it fails while the
        // backend is down and succeeds once it recovers.
        assert_eq!(pool.status().available, 1);
        assert!(pool.acquire().is_err());
        assert_eq!(pool.status().available, 1);

        pool.connector().fail_all.store(false, Ordering::SeqCst);
        let slot = pool.acquire().unwrap();
        assert!(slot.is_connected());
    }

    #[test]
    fn test_acquire_fails_when_no_connection_can_be_created() {
        let connector = TestConnector::default();
        connector.fail_all.store(true, Ordering::SeqCst);
        let pool = ResilientPool::new(connector, quick_config(2, 2));
        assert_eq!(pool.status().available, 0);

        let err = pool.acquire().err().unwrap();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(pool.status().pending, 0);
    }

    #[test]
    fn test_close_disconnects_idle_and_returned_slots() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(2, 2));
        let held = pool.acquire().unwrap();

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire().err().unwrap(), Error::Lifecycle(_)));

        drop(held);
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().available, 0);
    }

    #[test]
    fn test_duplicate_release_is_ignored() {
        let pool = ResilientPool::new(TestConnector::default(), quick_config(1, 1));
        pool.release_slot(0, Some(0));
        assert_eq!(pool.status().available, 1);
        assert_eq!(pool.connector().disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_config_normalization() {
        let config = PoolConfig {
            min_size: 8,
            max_size: 0,
            ..PoolConfig::default()
        }
        .normalized();
        assert_eq!(config.max_size, 1);
        assert_eq!(config.min_size, 1);
    }

    #[test]
    fn test_reserve_skips_known_ids() {
        let mut state: PoolState<()> = PoolState::new();
        state.outstanding.insert(0);
        state.available.push(IdleSlot {
            id: 2,
            conn: Some(()),
            idle_since: Instant::now(),
        });
        let reserved = state.reserve(4, 4);
        assert_eq!(reserved, vec![1, 3]);
        assert!(state.reserve(4, 4).is_empty());
    }
}
