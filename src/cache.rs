use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::ops::compute::Op;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A cached value and the scrape generation that produced it.
#[derive(Debug, Clone)]
struct Stamped<V> {
    generation: u64,
    value: V,
}

/// Last-good values keyed by name, expiring a fixed time after insertion.
///
/// Each value carries the generation that produced it; a write from an older
/// generation never replaces a newer one.
pub struct GenerationCache<V> {
    entries: Cache<String, Stamped<V>>,
}

impl<V> GenerationCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Store `value` for `key` unless an unexpired entry from a newer
    /// generation is present. Returns whether the value was stored.
    pub async fn store(&self, key: String, generation: u64, value: V) -> bool {
        let result = self
            .entries
            .entry(key)
            .and_compute_with(|current| {
                let newer = current.is_some_and(|e| e.value().generation > generation);
                let op = if newer {
                    Op::Nop
                } else {
                    Op::Put(Stamped { generation, value })
                };
                std::future::ready(op)
            })
            .await;

        !matches!(result, moka::ops::compute::CompResult::Unchanged(_))
    }

    /// Unexpired value for `key`.
    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).await.map(|e| e.value)
    }

    /// Generation of the unexpired value for `key`.
    pub async fn generation(&self, key: &str) -> Option<u64> {
        self.entries.get(key).await.map(|e| e.generation)
    }

    /// Approximate number of entries; exact after `run_pending_tasks`.
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    pub async fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks().await;
    }

    /// Spawn a task evicting expired entries every `interval`.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        cache.run_pending_tasks().await;
                        debug!(entries = cache.entry_count(), "cache maintenance");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_returns_stored_value() {
        let cache = GenerationCache::new(Duration::from_secs(60));
        assert!(cache.store("ec2".to_string(), 1, 7u32).await);

        assert_eq!(cache.get("ec2").await, Some(7));
        assert_eq!(cache.generation("ec2").await, Some(1));
        assert_eq!(cache.get("ebs").await, None);

        cache.run_pending_tasks().await;
        assert_eq!(cache.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_older_generation_does_not_replace_newer() {
        let cache = GenerationCache::new(Duration::from_secs(60));
        assert!(cache.store("ec2".to_string(), 2, "fresh").await);
        assert!(!cache.store("ec2".to_string(), 1, "stale").await);
        assert_eq!(cache.get("ec2").await, Some("fresh"));

        assert!(cache.store("ec2".to_string(), 3, "newest").await);
        assert_eq!(cache.get("ec2").await, Some("newest"));
        assert_eq!(cache.generation("ec2").await, Some(3));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = GenerationCache::new(Duration::from_millis(20));
        cache.store("k".to_string(), 5, 1u32).await;
        assert_eq!(cache.get("k").await, Some(1));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await, None);

        // An expired newer entry no longer blocks older generations.
        assert!(cache.store("k".to_string(), 1, 2u32).await);
        assert_eq!(cache.get("k").await, Some(2));
    }

    #[tokio::test]
    async fn test_maintenance_evicts_expired_and_stops() {
        let cache = Arc::new(GenerationCache::new(Duration::from_millis(10)));
        cache.store("k".to_string(), 1, 1u32).await;

        let cancel = CancellationToken::new();
        cache.spawn_maintenance(Duration::from_millis(5), cancel.clone());

        for _ in 0..100 {
            if cache.entry_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.entry_count(), 0);
        cancel.cancel();
    }
}
