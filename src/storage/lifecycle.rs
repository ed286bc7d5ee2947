//! Process-wide single-instance holder.
//!
//! Some clients must not be rebuilt per request: their pools are expensive to
//! fill and meant to be shared. A [`ProcessHandle`] holds at most one instance,
//! built on first access. After [`ProcessHandle::shutdown`] the handle refuses
//! to build another one.
//!
//! The handle is an ordinary value. Callers decide where it lives (a `static`,
//! an `Arc` in application state) and pass it explicitly.

use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Guarded holder for one shared instance of `T`.
///
/// # Example
///
/// ```rust,ignore
/// static RELATIONAL: ProcessHandle<RelationalClient<PostgresConnector>> =
///     ProcessHandle::new("relational");
///
/// let client = RELATIONAL.get_or_try_init(|| RelationalClient::connect(connector, &settings))?;
/// ```
pub struct ProcessHandle<T> {
    name: &'static str,
    instance: RwLock<Option<Arc<T>>>,
    init_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl<T> ProcessHandle<T> {
    /// Creates an empty handle.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            instance: RwLock::new(None),
            init_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the instance if one has been built.
    #[must_use]
    pub fn get(&self) -> Option<Arc<T>> {
        self.instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the shared instance, building it with `init` on first access.
    ///
    /// Concurrent first callers serialize on an init lock and re-check, so
    /// `init` runs once per successful construction. A failed `init` stores
    /// nothing; the next caller tries again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lifecycle`] after shutdown, or the error from `init`.
    pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(instance) = self.get() {
            return Ok(instance);
        }
        self.ensure_open()?;

        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        if let Some(instance) = self.get() {
            return Ok(instance);
        }

        let instance = Arc::new(init()?);
        *self.instance.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&instance));
        tracing::info!(handle = self.name, "Shared instance initialized");
        Ok(instance)
    }

    /// Takes the instance out and refuses any later initialization.
    ///
    /// Returns the instance, if one was built, so the caller can close it.
    pub fn shutdown(&self) -> Option<Arc<T>> {
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let first = !self.shut_down.swap(true, Ordering::SeqCst);
        let instance = self
            .instance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if first {
            tracing::info!(
                handle = self.name,
                had_instance = instance.is_some(),
                "Shared instance shut down"
            );
        }
        instance
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Lifecycle(format!(
                "{} handle was shut down and cannot be re-initialized",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_first_access_builds_once() {
        let handle = ProcessHandle::new("test");
        let builds = AtomicUsize::new(0);

        let a = handle
            .get_or_try_init(|| {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .unwrap();
        let b = handle
            .get_or_try_init(|| {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_init_stores_nothing() {
        let handle: ProcessHandle<u32> = ProcessHandle::new("test");
        let result = handle.get_or_try_init(|| Err(Error::InvalidInput("nope".to_string())));
        assert!(result.is_err());
        assert!(handle.get().is_none());

        assert_eq!(*handle.get_or_try_init(|| Ok(5)).unwrap(), 5);
    }

    #[test]
    fn test_concurrent_first_access_builds_once() {
        let handle = Arc::new(ProcessHandle::new("test"));
        let builds = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                let builds = Arc::clone(&builds);
                thread::spawn(move || {
                    handle
                        .get_or_try_init(|| {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok("client")
                        })
                        .unwrap()
                })
            })
            .collect();

        let instances: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[test]
    fn test_reinit_after_shutdown_is_refused() {
        let handle = ProcessHandle::new("test");
        handle.get_or_try_init(|| Ok(1)).unwrap();

        let taken = handle.shutdown();
        assert_eq!(taken.as_deref(), Some(&1));
        assert!(handle.is_shut_down());
        assert!(handle.get().is_none());
        assert!(handle.shutdown().is_none());

        let err = handle.get_or_try_init(|| Ok(2)).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
    }
}
