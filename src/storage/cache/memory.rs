//! In-memory cache.
//!
//! Strings and lists with lazy expiry. Using a list command on a string key
//! (or the reverse) fails with Redis's `WRONGTYPE` error.

use super::session::CacheSession;
use crate::storage::faults::FaultInjector;
use crate::storage::pool::{Connector, SlotId};
use crate::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const BACKEND: &str = "cache-memory";

enum Stored {
    Text(String),
    List(VecDeque<String>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct CacheData {
    entries: HashMap<String, Entry>,
}

impl CacheData {
    /// Drops the entry if it has expired, then returns it.
    fn live_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| !e.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }
}

/// Shared in-memory cache and its connector.
///
/// Cloning shares the same data and fault injector.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    data: Arc<Mutex<CacheData>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fault injector driving this cache.
    #[must_use]
    pub fn faults(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.faults)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.data)
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Returns `true` if no key is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Connector for InMemoryCache {
    type Connection = InMemoryCacheSession;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn connect(&self, slot: SlotId) -> Result<InMemoryCacheSession> {
        self.faults.on_connect(BACKEND)?;
        Ok(InMemoryCacheSession {
            slot,
            data: Arc::clone(&self.data),
            faults: Arc::clone(&self.faults),
        })
    }

    fn probe(&self, _conn: &mut InMemoryCacheSession) -> Result<()> {
        self.faults.on_probe(BACKEND)
    }
}

/// A session on an [`InMemoryCache`].
pub struct InMemoryCacheSession {
    slot: SlotId,
    data: Arc<Mutex<CacheData>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryCacheSession {
    /// Slot this session was created for.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    fn begin(&self) -> Result<MutexGuard<'_, CacheData>> {
        self.faults.on_operation(BACKEND)?;
        Ok(lock(&self.data))
    }
}

fn lock(data: &Mutex<CacheData>) -> MutexGuard<'_, CacheData> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wrong_type() -> Error {
    Error::Backend {
        backend: BACKEND,
        code: None,
        message: "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    }
}

impl CacheSession for InMemoryCacheSession {
    fn ping(&mut self) -> Result<()> {
        self.begin().map(|_| ())
    }

    fn get(&mut self, key: &str) -> Result<Option<String>> {
        let mut data = self.begin()?;
        match data.live_mut(key) {
            None => Ok(None),
            Some(Entry {
                value: Stored::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type()),
        }
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut data = self.begin()?;
        data.entries.insert(key.to_string(), Entry {
            value: Stored::Text(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        });
        Ok(())
    }

    fn delete(&mut self, keys: &[String]) -> Result<u64> {
        let mut data = self.begin()?;
        let mut removed = 0;
        for key in keys {
            if data.live_mut(key).is_some() {
                data.entries.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn scan_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        let data = self.begin()?;
        let now = Instant::now();
        Ok(data
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn exists(&mut self, key: &str) -> Result<bool> {
        let mut data = self.begin()?;
        Ok(data.live_mut(key).is_some())
    }

    fn push_front(&mut self, key: &str, value: &str) -> Result<u64> {
        let mut data = self.begin()?;
        if data.live_mut(key).is_none() {
            data.entries.insert(key.to_string(), Entry {
                value: Stored::List(VecDeque::new()),
                expires_at: None,
            });
        }
        match data.entries.get_mut(key) {
            Some(Entry {
                value: Stored::List(list),
                ..
            }) => {
                list.push_front(value.to_string());
                Ok(list.len() as u64)
            },
            _ => Err(wrong_type()),
        }
    }

    fn pop_back(&mut self, key: &str) -> Result<Option<String>> {
        let mut data = self.begin()?;
        let (popped, now_empty) = match data.live_mut(key) {
            None => return Ok(None),
            Some(Entry {
                value: Stored::List(list),
                ..
            }) => {
                let popped = list.pop_back();
                (popped, list.is_empty())
            },
            Some(_) => return Err(wrong_type()),
        };
        if now_empty {
            data.entries.remove(key);
        }
        Ok(popped)
    }
}
