use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use crate::time_util::epoch_ms;

type Weigher<V> = Box<dyn Fn(&V) -> u64 + Send + Sync>;
type DisposeHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Construction options for [`LruCache`].
pub struct LruOptions<K, V> {
    pub max_entries: usize,
    pub max_bytes: Option<u64>,
    /// Byte weight of a value; entries weigh zero without one.
    pub weigher: Option<Weigher<V>>,
    /// Invoked after an entry leaves the cache for any reason (eviction,
    /// replacement, removal, expiry, clear). Called outside the cache lock.
    pub on_dispose: Option<DisposeHook<K, V>>,
}

impl<K, V> Default for LruOptions<K, V> {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: None,
            weigher: None,
            on_dispose: None,
        }
    }
}

struct Slot<V> {
    value: V,
    bytes: u64,
    last_used: u64,
    expires_at_ms: Option<u64>,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    total_bytes: u64,
    tick: u64,
}

/// A bounded map with LRU eviction, byte-size accounting, optional
/// per-entry TTL, and a dispose hook. The building block behind the
/// resolution, manifest, and content caches.
pub struct LruCache<K: Eq + Hash + Clone, V: Clone> {
    inner: Mutex<Inner<K, V>>,
    options: LruOptions<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(options: LruOptions<K, V>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                total_bytes: 0,
                tick: 0,
            }),
            options,
        }
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self::new(LruOptions {
            max_entries,
            ..LruOptions::default()
        })
    }

    /// Insert, evicting least-recently-used entries until both budgets
    /// hold. Returns `false` (no insert) when the value alone exceeds the
    /// byte budget.
    pub fn insert(&self, key: K, value: V, ttl: Option<Duration>) -> bool {
        let weight = self
            .options
            .weigher
            .as_ref()
            .map(|w| w(&value))
            .unwrap_or(0);
        if let Some(max_bytes) = self.options.max_bytes {
            if weight > max_bytes {
                return false;
            }
        }
        let expires_at_ms = ttl.map(|ttl| epoch_ms() + ttl.as_millis() as u64);

        let mut disposed = Vec::new();
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return false,
            };
            inner.tick += 1;
            let tick = inner.tick;

            if let Some(old) = inner.map.remove(&key) {
                inner.total_bytes -= old.bytes;
                disposed.push((key.clone(), old.value));
            }

            // Make room before inserting.
            while inner.map.len() >= self.options.max_entries
                || self
                    .options
                    .max_bytes
                    .is_some_and(|max| inner.total_bytes + weight > max)
            {
                match Self::pop_lru(&mut inner) {
                    Some(entry) => disposed.push(entry),
                    None => break,
                }
            }

            inner.total_bytes += weight;
            inner.map.insert(
                key,
                Slot {
                    value,
                    bytes: weight,
                    last_used: tick,
                    expires_at_ms,
                },
            );
        }
        self.dispose(disposed);
        true
    }

    /// Clone out the live value for `key`, refreshing its recency. Expired
    /// entries are removed and reported as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut disposed = Vec::new();
        let result = {
            let mut inner = self.inner.lock().ok()?;
            inner.tick += 1;
            let tick = inner.tick;
            let expired = match inner.map.get(key) {
                Some(slot) => slot.expires_at_ms.is_some_and(|at| epoch_ms() >= at),
                None => return None,
            };
            if expired {
                if let Some(slot) = inner.map.remove(key) {
                    inner.total_bytes -= slot.bytes;
                    disposed.push((key.clone(), slot.value));
                }
                None
            } else {
                inner.map.get_mut(key).map(|slot| {
                    slot.last_used = tick;
                    slot.value.clone()
                })
            }
        };
        self.dispose(disposed);
        result
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .map
                    .get(key)
                    .is_some_and(|slot| !slot.expires_at_ms.is_some_and(|at| epoch_ms() >= at))
            })
            .unwrap_or(false)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = {
            let mut inner = self.inner.lock().ok()?;
            match inner.map.remove(key) {
                Some(slot) => {
                    inner.total_bytes -= slot.bytes;
                    Some(slot.value)
                }
                None => None,
            }
        };
        if let Some(value) = removed {
            self.dispose(vec![(key.clone(), value.clone())]);
            Some(value)
        } else {
            None
        }
    }

    /// Remove every entry whose key fails the predicate.
    pub fn retain<F: Fn(&K) -> bool>(&self, keep: F) {
        let mut disposed = Vec::new();
        if let Ok(mut inner) = self.inner.lock() {
            let doomed: Vec<K> = inner
                .map
                .keys()
                .filter(|k| !keep(k))
                .cloned()
                .collect();
            for key in doomed {
                if let Some(slot) = inner.map.remove(&key) {
                    inner.total_bytes -= slot.bytes;
                    disposed.push((key, slot.value));
                }
            }
        }
        self.dispose(disposed);
    }

    pub fn clear(&self) {
        let mut disposed = Vec::new();
        if let Ok(mut inner) = self.inner.lock() {
            for (key, slot) in inner.map.drain() {
                disposed.push((key, slot.value));
            }
            inner.total_bytes = 0;
        }
        self.dispose(disposed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.total_bytes)
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner
            .lock()
            .map(|inner| inner.map.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn pop_lru(inner: &mut Inner<K, V>) -> Option<(K, V)> {
        let oldest = inner
            .map
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(k, _)| k.clone())?;
        match inner.map.remove(&oldest) {
            Some(slot) => {
                inner.total_bytes -= slot.bytes;
                Some((oldest, slot.value))
            }
            None => None,
        }
    }

    fn dispose(&self, entries: Vec<(K, V)>) {
        if let Some(hook) = self.options.on_dispose.as_ref() {
            for (key, value) in &entries {
                hook(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn evicts_least_recently_used_beyond_entry_budget() {
        let cache = LruCache::with_max_entries(2);
        cache.insert("a", 1, None);
        cache.insert("b", 2, None);
        // Touch `a` so `b` becomes the LRU victim.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3, None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn byte_budget_is_never_exceeded() {
        let cache: LruCache<&str, Vec<u8>> = LruCache::new(LruOptions {
            max_entries: 100,
            max_bytes: Some(10),
            weigher: Some(Box::new(|v: &Vec<u8>| v.len() as u64)),
            on_dispose: None,
        });
        assert!(cache.insert("a", vec![0; 4], None));
        assert!(cache.insert("b", vec![0; 4], None));
        assert!(cache.insert("c", vec![0; 4], None));
        assert!(cache.total_bytes() <= 10);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oversized_value_is_rejected_outright() {
        let cache: LruCache<&str, Vec<u8>> = LruCache::new(LruOptions {
            max_entries: 100,
            max_bytes: Some(10),
            weigher: Some(Box::new(|v: &Vec<u8>| v.len() as u64)),
            on_dispose: None,
        });
        assert!(!cache.insert("big", vec![0; 11], None));
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let cache = LruCache::with_max_entries(10);
        cache.insert("k", 1, Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn unexpired_ttl_entries_are_live() {
        let cache = LruCache::with_max_entries(10);
        cache.insert("k", 1, Some(Duration::from_secs(60)));
        assert_eq!(cache.get(&"k"), Some(1));
        assert!(cache.contains_key(&"k"));
    }

    #[test]
    fn dispose_hook_fires_on_eviction_and_removal() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let cache: LruCache<&str, i32> = LruCache::new(LruOptions {
            max_entries: 1,
            max_bytes: None,
            weigher: None,
            on_dispose: Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        });
        cache.insert("a", 1, None);
        cache.insert("b", 2, None); // evicts `a`
        cache.remove(&"b");
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn replacement_disposes_the_old_value() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let cache: LruCache<&str, i32> = LruCache::new(LruOptions {
            max_entries: 10,
            max_bytes: None,
            weigher: None,
            on_dispose: Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        });
        cache.insert("a", 1, None);
        cache.insert("a", 2, None);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"a"), Some(2));
    }

    #[test]
    fn retain_drops_matching_keys() {
        let cache = LruCache::with_max_entries(10);
        cache.insert("tx1|", 1, None);
        cache.insert("tx1|a", 2, None);
        cache.insert("tx2|", 3, None);
        cache.retain(|k| !k.starts_with("tx1|"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"tx2|"), Some(3));
    }

    #[test]
    fn clear_empties_and_zeroes_accounting() {
        let cache: LruCache<&str, Vec<u8>> = LruCache::new(LruOptions {
            max_entries: 10,
            max_bytes: Some(100),
            weigher: Some(Box::new(|v: &Vec<u8>| v.len() as u64)),
            on_dispose: None,
        });
        cache.insert("a", vec![0; 5], None);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }
}
