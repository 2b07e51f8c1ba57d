//! In-process [`CounterStore`].
//!
//! Each operation takes the map lock once, does constant work and
//! releases it; nothing awaits or performs I/O while holding it.

use super::CounterStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How often expired entries are swept from the map.
const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
enum StoredValue {
    Counter(i64),
    Text(String),
}

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    /// `None` never expires.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// A TTL too large to represent (such as `NO_EXPIRY`) never expires.
fn expiry(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<String, Entry>,
    last_sweep: Instant,
}

/// Expiring key-value map with atomic counters.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_if_due(inner: &mut Inner, now: Instant) {
        if now.duration_since(inner.last_sweep) >= Duration::from_secs(SWEEP_INTERVAL_SECS) {
            inner.entries.retain(|_, entry| entry.is_live(now));
            inner.last_sweep = now;
        }
    }

    /// Apply `update` to the live counter at `key` (absent = `None`) and
    /// store the result. Text values are treated as absent.
    fn update_counter(
        &self,
        key: &str,
        ttl: Duration,
        update: impl FnOnce(Option<i64>) -> i64,
    ) -> i64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::sweep_if_due(&mut inner, now);

        let current = inner.entries.get(key).and_then(|entry| {
            match (&entry.value, entry.is_live(now)) {
                (StoredValue::Counter(v), true) => Some((*v, entry.expires_at)),
                _ => None,
            }
        });

        let (next, expires_at) = match current {
            Some((value, expires_at)) => (update(Some(value)), expires_at),
            None => (update(None), expiry(now, ttl)),
        };

        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: StoredValue::Counter(next),
                expires_at,
            },
        );
        next
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> anyhow::Result<i64> {
        Ok(self.update_counter(key, ttl, |current| {
            current.unwrap_or(0).saturating_add(delta)
        }))
    }

    async fn fetch_max(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<i64> {
        Ok(self.update_counter(key, ttl, |current| {
            current.map_or(value, |c| c.max(value))
        }))
    }

    async fn fetch_min(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<i64> {
        Ok(self.update_counter(key, ttl, |current| {
            current.map_or(value, |c| c.min(value))
        }))
    }

    async fn counter(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(match inner.entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.value {
                StoredValue::Counter(v) => v,
                StoredValue::Text(_) => 0,
            },
            _ => 0,
        })
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| match &entry.value {
                StoredValue::Text(text) => text.clone(),
                StoredValue::Counter(v) => v.to_string(),
            }))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::sweep_if_due(&mut inner, now);
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value: StoredValue::Text(value),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.inner.lock().entries.remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - inner.entries.len())
    }

    async fn counters_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, i64)>> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut out: Vec<(String, i64)> = inner
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .filter_map(|(key, entry)| match entry.value {
                StoredValue::Counter(v) => Some((key.clone(), v)),
                StoredValue::Text(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::NO_EXPIRY;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    /// Yields to the scheduler before every call, like a networked store.
    pub(crate) struct YieldingStore(pub(crate) MemoryStore);

    #[async_trait]
    impl CounterStore for YieldingStore {
        fn name(&self) -> &str {
            "yielding"
        }

        async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> anyhow::Result<i64> {
            tokio::task::yield_now().await;
            self.0.incr_by(key, delta, ttl).await
        }

        async fn fetch_max(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<i64> {
            tokio::task::yield_now().await;
            self.0.fetch_max(key, value, ttl).await
        }

        async fn fetch_min(&self, key: &str, value: i64, ttl: Duration) -> anyhow::Result<i64> {
            tokio::task::yield_now().await;
            self.0.fetch_min(key, value, ttl).await
        }

        async fn counter(&self, key: &str) -> anyhow::Result<i64> {
            tokio::task::yield_now().await;
            self.0.counter(key).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.0.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            self.0.delete(key).await
        }

        async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
            self.0.delete_prefix(prefix).await
        }

        async fn counters_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, i64)>> {
            self.0.counters_with_prefix(prefix).await
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn incr_starts_at_zero_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("k", 1, TTL).await.unwrap(), 1);
        assert_eq!(store.incr_by("k", 4, TTL).await.unwrap(), 5);
        assert_eq!(store.counter("k").await.unwrap(), 5);
        assert_eq!(store.counter("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_counter_restarts() {
        let store = MemoryStore::new();
        store.incr_by("k", 3, Duration::ZERO).await.unwrap();
        assert_eq!(store.counter("k").await.unwrap(), 0);
        assert_eq!(store.incr_by("k", 1, TTL).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.incr_by("shared", 1, TTL).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.counter("shared").await.unwrap(), 800);
    }

    #[tokio::test]
    async fn fetch_max_and_min_keep_extremes() {
        let store = MemoryStore::new();
        assert_eq!(store.fetch_max("max", 40, TTL).await.unwrap(), 40);
        assert_eq!(store.fetch_max("max", 10, TTL).await.unwrap(), 40);
        assert_eq!(store.fetch_max("max", 90, TTL).await.unwrap(), 90);

        assert_eq!(store.fetch_min("min", 40, TTL).await.unwrap(), 40);
        assert_eq!(store.fetch_min("min", 90, TTL).await.unwrap(), 40);
        assert_eq!(store.fetch_min("min", 5, TTL).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn no_expiry_keys_persist() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("c", 2, NO_EXPIRY).await.unwrap(), 2);
        store.set("t", "1".into(), NO_EXPIRY).await.unwrap();
        assert_eq!(store.counter("c").await.unwrap(), 2);
        assert_eq!(store.get("t").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn set_get_delete_text() {
        let store = MemoryStore::new();
        store.set("t", "payload".into(), TTL).await.unwrap();
        assert_eq!(store.get("t").await.unwrap().as_deref(), Some("payload"));
        assert!(store.delete("t").await.unwrap());
        assert!(!store.delete("t").await.unwrap());
        assert!(store.get("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn text_value_expires() {
        let store = MemoryStore::new();
        store.set("t", "payload".into(), Duration::ZERO).await.unwrap();
        assert!(store.get("t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_prefix_scopes_removal() {
        let store = MemoryStore::new();
        store.incr_by("rl:a:1", 1, TTL).await.unwrap();
        store.incr_by("rl:a:2", 1, TTL).await.unwrap();
        store.incr_by("rl:b:1", 1, TTL).await.unwrap();
        assert_eq!(store.delete_prefix("rl:a:").await.unwrap(), 2);
        assert_eq!(store.counter("rl:b:1").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn counters_with_prefix_skips_text_and_sorts() {
        let store = MemoryStore::new();
        store.incr_by("m:b", 2, TTL).await.unwrap();
        store.incr_by("m:a", 1, TTL).await.unwrap();
        store.set("m:text", "x".into(), TTL).await.unwrap();
        let counters = store.counters_with_prefix("m:").await.unwrap();
        assert_eq!(
            counters,
            vec![("m:a".to_string(), 1), ("m:b".to_string(), 2)]
        );
    }
}
