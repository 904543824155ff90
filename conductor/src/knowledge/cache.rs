//! Thread-safe TTL key/value cache
//!
//! Shared by the knowledge router (and optionally the agent pool for
//! deduplicated prompts). Keys are sharded across several locks so that
//! heavy use by one workflow does not serialize every other in-flight step
//! on a single mutex. No lock is ever held across an await point.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHARD_COUNT: usize = 16;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Sharded in-memory cache with per-entry TTL.
pub struct TtlCache<V> {
    shards: Vec<RwLock<HashMap<String, CacheEntry<V>>>>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, CacheEntry<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Returns a clone of the live value, or `None` if missing or expired.
    /// Expired entries are removed on the spot rather than waiting for the
    /// next sweep.
    pub fn get(&self, key: &str) -> Option<V> {
        let shard = self.shard(key);
        {
            let map = shard.read().ok()?;
            match map.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but is stale; drop it under the write lock.
        if let Ok(mut map) = shard.write() {
            if map.get(key).is_some_and(|e| e.expires_at <= Instant::now()) {
                map.remove(key);
            }
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        if let Ok(mut map) = self.shard(&key).write() {
            map.insert(
                key,
                CacheEntry {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut map) = self.shard(key).write() {
            map.remove(key);
        }
    }

    /// Drop every expired entry. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for shard in &self.shards {
            if let Ok(mut map) = shard.write() {
                let before = map.len();
                map.retain(|_, entry| entry.expires_at > now);
                evicted += before - map.len();
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .filter_map(|s| s.read().ok())
            .map(|m| m.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task sweeping `cache` every `interval` until `cancel`
/// fires.
pub fn spawn_sweeper<V>(
    cache: Arc<TtlCache<V>>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = cache.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "cache sweep");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_invalidate() {
        let cache: TtlCache<String> = TtlCache::new();
        cache.set("k", "v".to_string(), Duration::from_secs(60));

        assert_eq!(cache.get("k"), Some("v".to_string()));
        assert_eq!(cache.get("missing"), None);

        cache.invalidate("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_expired_entries_are_not_returned() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("stale", 1, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get("stale"), None);
        // The lazy removal in get() already dropped it.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_sweep_evicts_only_expired() {
        let cache: TtlCache<u32> = TtlCache::new();
        cache.set("old", 1, Duration::from_millis(0));
        cache.set("live", 2, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.get("live"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_access_across_shards() {
        let cache: Arc<TtlCache<usize>> = Arc::new(TtlCache::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("t{t}-{i}");
                    cache.set(&key, i, Duration::from_secs(60));
                    assert_eq!(cache.get(&key), Some(i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }

    #[tokio::test]
    async fn test_background_sweeper_stops_on_cancel() {
        let cache: Arc<TtlCache<u32>> = Arc::new(TtlCache::new());
        cache.set("old", 1, Duration::from_millis(0));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(cache.clone(), Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
