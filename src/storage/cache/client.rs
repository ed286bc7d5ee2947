//! Cache client.

use super::session::{CacheSession, CacheText};
use crate::config::StoreSettings;
use crate::storage::pool::{Connector, PoolConfig, PoolStatus, ResilientPool};
use crate::storage::resilience::BoundedRetry;
use crate::{Error, Result};
use std::time::Duration;

/// Keys deleted per `DEL` during a prefix delete.
const DELETE_BATCH: usize = 500;

/// Pooled key-value cache client with FIFO queue helpers.
///
/// Writes confirm the connection with `PING` first and go through the pool's
/// reconnect-and-retry-once discipline. Reads (`get`, `fetch`) use a bounded
/// retry with a fixed delay between attempts.
pub struct CacheClient<C>
where
    C: Connector,
    C::Connection: CacheSession,
{
    pool: ResilientPool<C>,
    read_retry: BoundedRetry,
}

impl<C> CacheClient<C>
where
    C: Connector,
    C::Connection: CacheSession,
{
    /// Creates a client; the initial `PING` must succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    pub fn connect(connector: C, settings: &StoreSettings) -> Result<Self> {
        Self::with_pool_config(
            connector,
            PoolConfig::from_settings(settings),
            BoundedRetry::from_settings(settings),
        )
    }

    /// Creates a client with explicit pool and read-retry configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    pub fn with_pool_config(connector: C, config: PoolConfig, read_retry: BoundedRetry) -> Result<Self> {
        let pool = ResilientPool::new(connector, config);
        pool.run("connect", |session| session.ping())?;
        tracing::info!(
            backend = pool.backend_name(),
            connections = pool.status().constructed(),
            "Cache client connected"
        );
        Ok(Self { pool, read_retry })
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &ResilientPool<C> {
        &self.pool
    }

    /// Returns a snapshot of pool occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Returns `true` until [`disconnect`](Self::disconnect) is called.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    /// Reads a key.
    ///
    /// # Errors
    ///
    /// Returns the last error once read retries are exhausted.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.read_retry.run(&self.pool, "get", |session| session.get(key))
    }

    /// Stores a value as text without expiry.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn set(&self, key: &str, value: impl CacheText) -> Result<()> {
        self.store(key, &value.to_cache_text(), None)
    }

    /// Stores a value as text that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a TTL under one millisecond, or the
    /// backend error.
    pub fn set_with_expiry(&self, key: &str, value: impl CacheText, ttl: Duration) -> Result<()> {
        if ttl.as_millis() == 0 {
            return Err(Error::InvalidInput(format!(
                "expiry for '{key}' must be at least 1ms"
            )));
        }
        self.store(key, &value.to_cache_text(), Some(ttl))
    }

    /// Deletes a key; returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let keys = [key.to_string()];
        self.write("delete", |session| session.delete(&keys))
            .map(|removed| removed > 0)
    }

    /// Deletes every key starting with `prefix`; returns how many were
    /// removed.
    ///
    /// Keys are scanned, then deleted in batches. Keys written under the prefix
    /// while this runs may survive.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let removed = self.write("delete_by_prefix", |session| {
            let keys = session.scan_prefix(prefix)?;
            keys.chunks(DELETE_BATCH)
                .try_fold(0_u64, |total, batch| Ok(total + session.delete(batch)?))
        })?;
        tracing::debug!(prefix, removed, "Deleted keys by prefix");
        Ok(removed)
    }

    /// Returns whether a key exists.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.write("exists", |session| session.exists(key))
    }

    /// Adds a value to the head of a queue; returns the queue length.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub fn push(&self, queue: &str, value: impl CacheText) -> Result<u64> {
        let text = value.to_cache_text();
        self.write("push", |session| session.push_front(queue, &text))
    }

    /// Takes the oldest value from a queue.
    ///
    /// # Errors
    ///
    /// Returns the last error once read retries are exhausted.
    pub fn fetch(&self, queue: &str) -> Result<Option<String>> {
        self.read_retry
            .run(&self.pool, "fetch", |session| session.pop_back(queue))
    }

    /// Releases every connection and closes the pool. Idempotent; later
    /// operations fail with [`Error::Lifecycle`].
    pub fn disconnect(&self) {
        if self.pool.is_closed() {
            tracing::debug!(backend = self.pool.backend_name(), "Cache already disconnected");
            return;
        }
        self.pool.close();
        tracing::info!(backend = self.pool.backend_name(), "Cache disconnected");
    }

    fn store(&self, key: &str, text: &str, ttl: Option<Duration>) -> Result<()> {
        self.write("set", |session| session.set(key, text, ttl))
    }

    /// Runs a write after confirming the connection with `PING`.
    fn write<T, F>(&self, operation: &'static str, mut work: F) -> Result<T>
    where
        F: FnMut(&mut C::Connection) -> Result<T>,
    {
        self.pool.run(operation, |session| {
            session.ping()?;
            work(session)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cache::InMemoryCache;

    fn client(cache: &InMemoryCache) -> CacheClient<InMemoryCache> {
        CacheClient::with_pool_config(
            cache.clone(),
            PoolConfig::with_capacity(2),
            BoundedRetry::new(3, Duration::from_millis(1)),
        )
        .unwrap()
    }

    #[test]
    fn test_connect_requires_ping() {
        let cache = InMemoryCache::new();
        cache.faults().set_unreachable(true);
        let result = CacheClient::with_pool_config(
            cache,
            PoolConfig::with_capacity(1),
            BoundedRetry::default(),
        );
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[test]
    fn test_set_get_coerces_to_text() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        client.set("k", 42).unwrap();
        assert_eq!(client.get("k").unwrap().as_deref(), Some("42"));
        client.set("none", Option::<&str>::None).unwrap();
        assert_eq!(client.get("none").unwrap().as_deref(), Some(""));
        assert_eq!(client.get("missing").unwrap(), None);
    }

    #[test]
    fn test_set_with_expiry() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        client
            .set_with_expiry("short", "v", Duration::from_millis(20))
            .unwrap();
        assert!(client.exists("short").unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!client.exists("short").unwrap());
        assert!(matches!(
            client.set_with_expiry("k", "v", Duration::ZERO),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_queue_is_fifo() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        assert_eq!(client.push("q", "a").unwrap(), 1);
        assert_eq!(client.push("q", "b").unwrap(), 2);
        assert_eq!(client.fetch("q").unwrap().as_deref(), Some("a"));
        assert_eq!(client.fetch("q").unwrap().as_deref(), Some("b"));
        assert_eq!(client.fetch("q").unwrap(), None);
    }

    #[test]
    fn test_delete_and_delete_by_prefix() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        for key in ["user:1", "user:2", "user:*", "order:1"] {
            client.set(key, 1).unwrap();
        }
        assert!(client.delete("order:1").unwrap());
        assert!(!client.delete("order:1").unwrap());
        assert_eq!(client.delete_by_prefix("user:").unwrap(), 3);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_write_recovers_from_one_transient_failure() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        cache.faults().fail_next_operations(1);
        client.set("k", "v").unwrap();
        assert_eq!(client.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_get_retries_within_bound() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        client.set("k", "v").unwrap();
        cache.faults().fail_next_operations(2);
        assert_eq!(client.get("k").unwrap().as_deref(), Some("v"));

        cache.faults().fail_next_operations(3);
        assert!(client.get("k").unwrap_err().is_transient());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let cache = InMemoryCache::new();
        let client = client(&cache);
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
        assert!(matches!(client.get("k"), Err(Error::Lifecycle(_))));
        assert!(matches!(client.set("k", 1), Err(Error::Lifecycle(_))));
    }
}
