//! Keyed async cache with flush-on-invalidate.
//!
//! No TTL: `flush` is the sole invalidation path, driven by the database
//! watcher before the active mode refreshes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

pub struct CacheManager<K, V> {
    slots: Mutex<HashMap<K, Arc<Mutex<Option<V>>>>>,
}

impl<K, V> CacheManager<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    pub async fn put(&self, key: K, value: V) {
        self.slots
            .lock()
            .await
            .insert(key, Arc::new(Mutex::new(Some(value))));
    }

    /// At most one producer runs per key: concurrent callers on the same
    /// key block on the first one and observe its value. A failed producer
    /// leaves the slot empty so the next caller retries.
    pub async fn get_or_compute<F, Fut, E>(&self, key: K, produce: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self
            .slots
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();

        let mut guard = slot.lock().await;
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let value = produce().await?;
        *guard = Some(value.clone());
        Ok(value)
    }

    /// Drop every entry. Once this returns, any prior key reads as absent;
    /// in-flight producers finish into detached slots and are recomputed on
    /// the next lookup.
    pub async fn flush(&self) {
        let mut slots = self.slots.lock().await;
        let dropped = slots.len();
        slots.clear();
        debug!(dropped, "cache flushed");
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl<K, V> Default for CacheManager<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_get_or_compute_runs_producer_once_per_key() {
        let cache = Arc::new(CacheManager::<String, u64>::new());
        let produced = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let produced = produced.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("modes".to_string(), || async {
                        produced.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, std::convert::Infallible>(42)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_flush_makes_prior_keys_absent() {
        let cache = CacheManager::<&str, u32>::new();
        cache.put("a", 1).await;
        cache.put("b", 2).await;
        assert_eq!(cache.get(&"a").await, Some(1));

        cache.flush().await;
        assert_eq!(cache.get(&"a").await, None);
        assert_eq!(cache.get(&"b").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_producer_retries() {
        let cache = CacheManager::<&str, u32>::new();
        let attempts = AtomicUsize::new(0);

        let result: Result<u32, &str> = cache
            .get_or_compute("k", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("db busy")
            })
            .await;
        assert!(result.is_err());

        let value = cache
            .get_or_compute("k", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let cache = CacheManager::<&str, u32>::new();
        cache.put("k", 1).await;
        cache.put("k", 2).await;
        assert_eq!(cache.get(&"k").await, Some(2));
    }
}
