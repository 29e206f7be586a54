//! Maintenance Task
//!
//! Background task that periodically asks a provider to sweep expired
//! items and compact itself below its capacity target.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::CacheProvider;

/// Spawns a background task that periodically runs provider maintenance.
///
/// The task runs in an infinite loop, sleeping for the specified interval
/// between runs. Each run calls the provider's `perform_maintenance`; a
/// failing run is logged and the loop keeps going, so a transient backend
/// outage never kills the schedule.
///
/// # Arguments
/// * `provider` - shared provider to maintain
/// * `interval_secs` - interval in seconds between maintenance runs
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let handle = spawn_maintenance_task(Arc::clone(manager.provider()), 60);
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_maintenance_task(
    provider: Arc<dyn CacheProvider>,
    interval_secs: u64,
) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs);

    tokio::spawn(async move {
        info!(
            provider = provider.name(),
            "Starting maintenance task with interval of {} seconds", interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            match provider.perform_maintenance().await {
                Ok(removed) if removed > 0 => {
                    info!(
                        provider = provider.name(),
                        "Maintenance: removed {} entries", removed
                    );
                }
                Ok(_) => {
                    debug!(provider = provider.name(), "Maintenance: nothing to remove");
                }
                Err(err) => {
                    warn!(provider = provider.name(), %err, "Maintenance run failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::item::CacheItem;
    use crate::providers::InMemoryProvider;
    use chrono::Utc;
    use std::collections::HashSet;

    fn provider() -> Arc<InMemoryProvider> {
        Arc::new(InMemoryProvider::with_name(
            "memory",
            MemoryConfig::default(),
            300,
            true,
        ))
    }

    fn item(key: &str, ttl_secs: i64) -> CacheItem {
        CacheItem::new(
            key,
            None,
            serde_json::json!("value"),
            "&str",
            HashSet::new(),
            Some(Utc::now() + chrono::Duration::seconds(ttl_secs)),
        )
    }

    #[tokio::test]
    async fn test_maintenance_task_removes_expired_entries() {
        let provider = provider();
        provider.set(item("expire_soon", 1)).await.unwrap();

        let handle = spawn_maintenance_task(provider.clone(), 1);

        // Wait for the entry to expire and a maintenance run to pass
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert!(!provider.exists("expire_soon", None).await.unwrap());
        handle.abort();
    }

    #[tokio::test]
    async fn test_maintenance_task_preserves_valid_entries() {
        let provider = provider();
        provider.set(item("long_lived", 3600)).await.unwrap();

        let handle = spawn_maintenance_task(provider.clone(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(provider.exists("long_lived", None).await.unwrap());
        handle.abort();
    }

    #[tokio::test]
    async fn test_maintenance_task_can_be_aborted() {
        let handle = spawn_maintenance_task(provider(), 1);

        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
