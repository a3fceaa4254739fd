//! Shared TTL cache.
//!
//! Plugins are instantiated per event and own no state of their own, so
//! anything that must survive between handler invocations (a parked half of
//! a rename pair, an open log file, a config snapshot) goes through this
//! cache. One instance is shared by every watch and every plugin of an
//! observer, and outlives all of them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Opaque cache payload.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: CacheValue,
    /// Insertion time; `None` marks a persistent entry exempt from expiry.
    stamp: Option<Instant>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    pushes: usize,
}

/// A mutex-serialised key/value store with per-entry time-to-live and an
/// amortised purge policy.
///
/// Expiry is not timer-driven: every `purge_interval` pushes, one sweep
/// removes the entries older than `max_age`. Persistent entries are never
/// expired by age and must be removed explicitly with [`pop`](Cache::pop).
pub struct Cache {
    max_age: Duration,
    purge_interval: usize,
    inner: Mutex<Inner>,
}

impl Cache {
    /// Create a cache expiring entries older than `max_age`, sweeping every
    /// `purge_interval` pushes.
    pub fn new(max_age: Duration, purge_interval: usize) -> Self {
        Self {
            max_age,
            purge_interval: purge_interval.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                pushes: 0,
            }),
        }
    }

    /// Store `value` under `key`, overwriting any previous entry (including
    /// its persistence). Counts towards the purge interval; the sweep, when
    /// due, runs before the new entry is inserted.
    pub fn push(&self, key: impl Into<String>, value: CacheValue, persistent: bool) {
        let mut inner = self.inner.lock();
        inner.pushes += 1;
        if inner.pushes > self.purge_interval {
            Self::sweep(&mut inner, self.max_age);
            inner.pushes = 0;
        }
        let stamp = if persistent { None } else { Some(Instant::now()) };
        inner.entries.insert(key.into(), Entry { value, stamp });
    }

    /// Atomically remove and return the entry under `key`.
    pub fn pop(&self, key: &str) -> Option<CacheValue> {
        self.inner.lock().entries.remove(key).map(|e| e.value)
    }

    /// Return the entry under `key` without removing it.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Typed [`get`](Cache::get); `None` when absent or of another type.
    pub fn get_as<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key).and_then(|v| v.downcast::<T>().ok())
    }

    /// Typed [`pop`](Cache::pop); `None` when absent or of another type.
    pub fn pop_as<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.pop(key).and_then(|v| v.downcast::<T>().ok())
    }

    /// Remove every non-persistent entry whose age exceeds `max_age`.
    pub fn purge(&self) {
        Self::sweep(&mut self.inner.lock(), self.max_age);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    fn sweep(inner: &mut Inner, max_age: Duration) {
        let now = Instant::now();
        inner
            .entries
            .retain(|_, entry| match entry.stamp {
                Some(stamp) => now.duration_since(stamp) <= max_age,
                None => true,
            });
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("max_age", &self.max_age)
            .field("purge_interval", &self.purge_interval)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: u32) -> CacheValue {
        Arc::new(n)
    }

    #[test]
    fn test_push_pop() {
        let cache = Cache::new(Duration::ZERO, 10);
        cache.push("number of the beast", value(666), false);
        let got = cache.pop_as::<u32>("number of the beast").unwrap();
        assert_eq!(*got, 666);
        assert!(cache.pop("number of the beast").is_none());
    }

    #[test]
    fn test_get_does_not_remove() {
        let cache = Cache::new(Duration::from_secs(3), 10);
        cache.push("k", value(1), false);
        assert!(cache.get("k").is_some());
        assert!(cache.get("k").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_pop_missing_is_absent() {
        let cache = Cache::new(Duration::ZERO, 10);
        assert!(cache.pop("nope").is_none());
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn test_expiry_on_interval() {
        // max_age 0: every non-persistent entry is stale by the next sweep.
        let cache = Cache::new(Duration::ZERO, 10);
        for i in 1..6 {
            cache.push(format!("k{i}"), value(i), false);
        }
        assert_eq!(cache.len(), 5);
        for i in 1..6 {
            cache.push(format!("p{i}"), value(i), true);
        }
        assert_eq!(cache.len(), 10);
        // Eleventh push crosses the interval: sweep fires before insert.
        std::thread::sleep(Duration::from_millis(2));
        cache.push("boo", value(1), false);
        assert_eq!(cache.len(), 6);
        assert!(cache.get("boo").is_some());
        for i in 1..6 {
            assert!(cache.get(&format!("p{i}")).is_some());
            assert!(cache.get(&format!("k{i}")).is_none());
        }
    }

    #[test]
    fn test_no_expiry_within_max_age() {
        let cache = Cache::new(Duration::from_secs(3), 10);
        for i in 1..6 {
            cache.push(format!("k{i}"), value(i), false);
        }
        for i in 1..6 {
            cache.push(format!("p{i}"), value(i), true);
        }
        cache.push("boo", value(1), false);
        assert_eq!(cache.len(), 11);
    }

    #[test]
    fn test_persistent_survives_purge() {
        let cache = Cache::new(Duration::ZERO, 1000);
        cache.push("keep", value(1), false);
        cache.push("keep", value(2), true);
        std::thread::sleep(Duration::from_millis(2));
        cache.purge();
        let got = cache.get_as::<u32>("keep").unwrap();
        assert_eq!(*got, 2);
    }

    #[test]
    fn test_repush_overwrites_persistence() {
        let cache = Cache::new(Duration::ZERO, 1000);
        cache.push("k", value(1), true);
        cache.push("k", value(2), false);
        std::thread::sleep(Duration::from_millis(2));
        cache.purge();
        assert!(cache.get("k").is_none());
    }
}
