//! Tracking of shared objects without extending their lifetime.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Cleanup = Box<dyn FnOnce() + Send>;

struct Tracked<T> {
    target: Weak<T>,
    cleanup: Cleanup,
}

/// Keyed weak references, each with a cleanup callback that runs exactly
/// once: on explicit [`cleanup`](Self::cleanup), or the first time the
/// registry notices the object is gone.
pub struct WeakRegistry<T> {
    entries: Mutex<HashMap<String, Tracked<T>>>,
}

impl<T> WeakRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Tracked<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `object` under `key`. A previous registration under the same key
    /// is cleaned up first.
    pub fn register(&self, key: impl Into<String>, object: &Arc<T>, cleanup: impl FnOnce() + Send + 'static) {
        let tracked = Tracked {
            target: Arc::downgrade(object),
            cleanup: Box::new(cleanup),
        };
        let previous = self.entries().insert(key.into(), tracked);
        if let Some(previous) = previous {
            (previous.cleanup)();
        }
    }

    /// The object, if it is still alive.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let dead = {
            let mut entries = self.entries();
            let state = entries.get(key).map(|t| t.target.upgrade());
            match state {
                Some(Some(alive)) => return Some(alive),
                Some(None) => entries.remove(key),
                None => None,
            }
        };
        if let Some(dead) = dead {
            (dead.cleanup)();
        }
        None
    }

    /// Stop tracking `key` and run its callback. Returns whether it was tracked.
    pub fn cleanup(&self, key: &str) -> bool {
        let removed = self.entries().remove(key);
        match removed {
            Some(tracked) => {
                (tracked.cleanup)();
                true
            }
            None => false,
        }
    }

    /// Clean up every entry whose key starts with `prefix`.
    pub fn cleanup_prefix(&self, prefix: &str) -> usize {
        let removed: Vec<Tracked<T>> = {
            let mut entries = self.entries();
            let keys: Vec<String> = entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = removed.len();
        for tracked in removed {
            (tracked.cleanup)();
        }
        count
    }

    /// Clean up every entry whose object has been dropped.
    pub fn sweep(&self) -> usize {
        let dead: Vec<Tracked<T>> = {
            let mut entries = self.entries();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, t)| t.target.strong_count() == 0)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = dead.len();
        for tracked in dead {
            (tracked.cleanup)();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WeakRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for WeakRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRegistry").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_get_does_not_extend_lifetime() {
        let registry = WeakRegistry::new();
        let object = Arc::new(String::from("payload"));
        let (calls, cleanup) = counter();
        registry.register("a", &object, cleanup);

        assert_eq!(registry.get("a").as_deref().map(String::as_str), Some("payload"));
        drop(object);

        assert!(registry.get("a").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.get("a").is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_cleanup_runs_once() {
        let registry = WeakRegistry::new();
        let object = Arc::new(1u32);
        let (calls, cleanup) = counter();
        registry.register("a", &object, cleanup);

        assert!(registry.cleanup("a"));
        assert!(!registry.cleanup("a"));
        drop(object);
        assert_eq!(registry.sweep(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_and_prefix() {
        let registry = WeakRegistry::new();
        let keep = Arc::new(1u32);
        let (calls, cleanup) = counter();
        registry.register("op1/a", &keep, cleanup);
        {
            let gone = Arc::new(2u32);
            registry.register("op2/b", &gone, || {});
        }
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.cleanup_prefix("op1/"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_cleans_previous() {
        let registry = WeakRegistry::new();
        let object = Arc::new(1u32);
        let (calls, cleanup) = counter();
        registry.register("a", &object, cleanup);
        registry.register("a", &object, || {});
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
