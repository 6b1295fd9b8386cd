use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use context_core::{EngineEvent, Topic};
use serde_json::json;
use storage::{CollectionRegistry, VectorStore};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::SubscriptionBus;

/// Low-rate snapshots of the vector store's collections and point
/// counts. Emits `qdrant:stats` only when a snapshot differs from the
/// previous one, and refreshes the cached counts on the registry.
pub struct VectorStoreMonitor {
    store: Arc<dyn VectorStore>,
    registry: Arc<CollectionRegistry>,
    bus: Arc<SubscriptionBus>,
    interval: Duration,
}

impl VectorStoreMonitor {
    pub fn new(
        store: Arc<dyn VectorStore>,
        registry: Arc<CollectionRegistry>,
        bus: Arc<SubscriptionBus>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("vector-store monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut previous: Option<HashMap<String, u64>> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    match self.snapshot().await {
                        Ok(snapshot) => {
                            if previous.as_ref() != Some(&snapshot) {
                                self.emit(&snapshot, previous.as_ref()).await;
                                previous = Some(snapshot);
                            }
                        }
                        Err(e) => {
                            warn!("vector-store snapshot failed: {}", e);
                            self.bus.publish(EngineEvent::error(
                                "vector-store-monitor",
                                &e.to_string(),
                                json!({}),
                            ));
                        }
                    }
                }
            }
        }
        info!("vector-store monitor stopped");
    }

    async fn snapshot(&self) -> context_core::Result<HashMap<String, u64>> {
        let mut counts = HashMap::new();
        for name in self.store.list_collections().await? {
            let count = self.store.count(&name).await?;
            counts.insert(name, count);
        }
        Ok(counts)
    }

    async fn emit(&self, snapshot: &HashMap<String, u64>, previous: Option<&HashMap<String, u64>>) {
        let mut collections: Vec<_> = snapshot
            .iter()
            .map(|(name, points)| json!({"name": name, "points": points}))
            .collect();
        collections.sort_by_key(|c| c["name"].as_str().unwrap_or_default().to_string());

        self.bus.publish(EngineEvent::new(
            Topic::VectorStats,
            json!({
                "collections": collections,
                "totalPoints": snapshot.values().sum::<u64>(),
            }),
        ));

        // Refresh the cache only where the count actually moved.
        for (name, points) in snapshot {
            let changed = previous
                .map(|prev| prev.get(name) != Some(points))
                .unwrap_or(true);
            if changed {
                if let Err(e) = self.registry.set_point_count(name, *points as i64).await {
                    warn!(collection = %name, "point-count cache refresh failed: {}", e);
                }
            }
        }
    }
}
