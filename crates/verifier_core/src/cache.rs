//! Bounded in-memory caches with periodic full flush
//!
//! Both engine caches share one implementation: a string-keyed map with
//! FIFO capacity eviction and an optional timer task that clears the whole
//! cache at a fixed interval. Verdicts are cached per address, MX record
//! lists per domain.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::resolver::MxRecord;

/// Cache from email address to its last computed verdict.
pub type VerdictCache = BoundedCache<String>;

/// Cache from domain name to its resolved MX record list.
pub type MxCache = BoundedCache<Vec<MxRecord>>;

/// A string-keyed cache holding at most `max_size` entries.
///
/// Inserting at capacity evicts the oldest-inserted entry. Inserting an
/// existing key overwrites its value and keeps its eviction position.
/// All operations serialize on a single mutex; none of them can fail.
pub struct BoundedCache<V> {
    name: &'static str,
    max_size: usize,
    inner: Mutex<Inner<V>>,
}

struct Inner<V> {
    entries: HashMap<String, V>,
    // insertion order, oldest at the front
    order: VecDeque<String>,
}

impl<V: Clone> BoundedCache<V> {
    /// Create a cache named `name` (used in log lines) holding at most
    /// `max_size` entries.
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            max_size,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Look up `key`, returning a clone of the stored value. The entry is
    /// not promoted.
    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(key).cloned()
    }

    /// Insert `key`/`value`, evicting the oldest entry when at capacity.
    pub fn put(&self, key: String, value: V) {
        if self.max_size == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.entries.insert(key.clone(), value).is_some() {
            // overwrite keeps the original queue position
            return;
        }
        if inner.order.len() >= self.max_size {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.order.push_back(key);
    }

    /// Remove every entry.
    pub fn flush_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = inner.order.len();
        inner.entries.clear();
        inner.order.clear();
        debug!(cache = self.name, dropped, "cache flushed");
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Start the periodic flush task for `cache`.
///
/// The task holds only a weak reference, so it ends on its own once the
/// cache is dropped instead of pinning it alive. Returns `None` when
/// `period` is `None` (flush timer disabled).
pub fn spawn_flush_timer<V>(
    cache: &Arc<BoundedCache<V>>,
    period: Option<Duration>,
) -> Option<JoinHandle<()>>
where
    V: Clone + Send + 'static,
{
    let period = period?;
    let weak: Weak<BoundedCache<V>> = Arc::downgrade(cache);
    let name = cache.name;
    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            match weak.upgrade() {
                Some(cache) => cache.flush_all(),
                None => {
                    debug!(cache = name, "cache dropped, flush timer exiting");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_get_miss_and_hit() {
        let cache = VerdictCache::new("test", 4);
        assert_eq!(cache.get("a@x.test"), None);
        cache.put("a@x.test".to_string(), "OK".to_string());
        assert_eq!(cache.get("a@x.test"), Some("OK".to_string()));
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let cache = VerdictCache::new("test", 2);
        cache.put("first".to_string(), "1".to_string());
        cache.put("second".to_string(), "2".to_string());
        cache.put("third".to_string(), "3".to_string());

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first"), None);
        assert_eq!(cache.get("second"), Some("2".to_string()));
        assert_eq!(cache.get("third"), Some("3".to_string()));
    }

    #[test]
    fn test_duplicate_key_coalesces() {
        let cache = VerdictCache::new("test", 2);
        cache.put("a".to_string(), "old".to_string());
        cache.put("a".to_string(), "new".to_string());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some("new".to_string()));

        // the overwritten entry kept its queue position, so it is still
        // the first to go
        cache.put("b".to_string(), "2".to_string());
        cache.put("c".to_string(), "3".to_string());
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some("3".to_string()));
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let cache = VerdictCache::new("test", 3);
        for i in 0..100 {
            cache.put(format!("key-{i}"), "v".to_string());
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let cache = VerdictCache::new("test", 0);
        cache.put("a".to_string(), "1".to_string());
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_flush_all() {
        let cache = MxCache::new("test", 8);
        cache.put(
            "x.test".to_string(),
            vec![MxRecord {
                host: "mx.x.test".to_string(),
                priority: 10,
            }],
        );
        assert_eq!(cache.len(), 1);
        cache.flush_all();
        assert!(cache.is_empty());
        assert_eq!(cache.get("x.test"), None);
    }

    #[test]
    fn test_mx_cache_value_equality() {
        let cache = MxCache::new("test", 8);
        let records = vec![
            MxRecord {
                host: "mx1.x.test".to_string(),
                priority: 10,
            },
            MxRecord {
                host: "mx2.x.test".to_string(),
                priority: 20,
            },
        ];
        cache.put("x.test".to_string(), records.clone());
        assert_eq!(cache.get("x.test"), Some(records));
    }

    #[tokio::test]
    async fn test_disabled_timer_never_flushes() {
        let cache = Arc::new(VerdictCache::new("test", 4));
        assert!(spawn_flush_timer(&cache, None).is_none());
        cache.put("a".to_string(), "1".to_string());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timer_clears_periodically() {
        let cache = Arc::new(VerdictCache::new("test", 4));
        let handle = spawn_flush_timer(&cache, Some(Duration::from_secs(60)));
        assert!(handle.is_some());

        cache.put("a".to_string(), "1".to_string());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty());

        cache.put("b".to_string(), "2".to_string());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_timer_ends_when_cache_dropped() {
        let cache = Arc::new(VerdictCache::new("test", 4));
        let handle = spawn_flush_timer(&cache, Some(Duration::from_secs(1))).unwrap();
        drop(cache);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(handle.is_finished());
    }
}
