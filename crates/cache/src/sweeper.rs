//! Background expiry sweep.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::Shared;

/// Handle to a running sweeper. Dropping it stops the sweep.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweep and wait for the task to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(crate) fn spawn<V: Send + 'static>(shared: Weak<Shared<V>>, period: Duration) -> SweeperHandle {
    spawn_on(&Handle::current(), shared, period)
}

pub(crate) fn spawn_on<V: Send + 'static>(
    runtime: &Handle,
    shared: Weak<Shared<V>>,
    period: Duration,
) -> SweeperHandle {
    let token = CancellationToken::new();
    let stop = token.clone();
    let period = period.max(Duration::from_millis(1));

    let task = runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    info!("cache sweeper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let Some(shared) = shared.upgrade() else {
                        debug!("cache dropped, sweeper exiting");
                        break;
                    };
                    let removed = shared.purge_expired();
                    if removed > 0 {
                        debug!(removed, "cache sweep removed expired entries");
                    }
                }
            }
        }
    });

    SweeperHandle {
        token,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use crate::{CacheConfig, CacheManager, SetOptions};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn sweeper_removes_expired_entries_without_access() {
        let cache: CacheManager<serde_json::Value> = CacheManager::new(CacheConfig::default());
        cache.set("a", json!(1), SetOptions::ttl(Duration::from_millis(20)));
        let handle = cache.start_sweeper(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.expirations, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn owned_sweeper_starts_once_and_purges() {
        let cache: CacheManager<serde_json::Value> =
            CacheManager::new(CacheConfig::default().with_sweep_interval(Duration::from_millis(10)));
        assert!(!cache.has_sweeper());
        assert!(cache.ensure_sweeper());
        assert!(cache.clone().ensure_sweeper());
        assert!(cache.has_sweeper());

        cache.set("a", json!(1), SetOptions::ttl(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn owned_sweeper_needs_a_runtime() {
        let cache: CacheManager<serde_json::Value> = CacheManager::new(CacheConfig::default());
        assert!(!cache.ensure_sweeper());
        assert!(!cache.has_sweeper());
    }

    #[tokio::test]
    async fn sweeper_exits_when_cache_dropped() {
        let cache: CacheManager<serde_json::Value> = CacheManager::new(CacheConfig::default());
        let handle = cache.start_sweeper(Duration::from_millis(10));
        drop(cache);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
