use std::sync::Arc;
use std::time::Duration;

use context_core::{EngineEvent, Topic};
use serde_json::json;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use storage::StatsReader;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::bus::SubscriptionBus;

/// How long to keep draining queued notifications after the first one,
/// so a burst of table mutations produces one snapshot.
const NOTIFY_SETTLE: Duration = Duration::from_millis(250);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Listens on `stats_updates` and `github_job_updates`, re-queries the
/// aggregate snapshot on signal (coalesced) and on a safety-net timer,
/// and fans the result out per project plus a `project=all` rollup.
pub struct MetadataMonitor {
    pool: PgPool,
    stats: StatsReader,
    bus: Arc<SubscriptionBus>,
    poll_interval: Duration,
}

impl MetadataMonitor {
    pub fn new(
        pool: PgPool,
        stats: StatsReader,
        bus: Arc<SubscriptionBus>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            stats,
            bus,
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("metadata monitor started");
        loop {
            match self.listen(&mut shutdown).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("metadata monitor listener failed: {}", e);
                    self.bus.publish(EngineEvent::error(
                        "metadata-monitor",
                        &e.to_string(),
                        json!({"action": "reconnecting"}),
                    ));
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("metadata monitor stopped");
    }

    async fn listen(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all(["stats_updates", "github_job_updates"])
            .await?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => self.emit_snapshot().await,
                notification = listener.recv() => {
                    notification?;
                    // Coalesce the burst before querying.
                    tokio::time::sleep(NOTIFY_SETTLE).await;
                    while let Ok(Some(_)) = listener.try_recv().await {}
                    self.emit_snapshot().await;
                }
            }
        }
    }

    async fn emit_snapshot(&self) {
        match self.stats.snapshot().await {
            Ok(snapshot) => {
                for project in &snapshot.projects {
                    let crawls: Vec<_> = snapshot
                        .recent_crawls
                        .iter()
                        .filter(|c| c.project == project.name)
                        .collect();
                    self.bus.publish(EngineEvent::for_project(
                        Topic::PostgresStats,
                        project.name.clone(),
                        json!({
                            "projects": [project],
                            "recentCrawls": crawls,
                        }),
                    ));
                }
                self.bus.publish(EngineEvent::for_project(
                    Topic::PostgresStats,
                    "all",
                    json!({
                        "projects": snapshot.projects,
                        "recentCrawls": snapshot.recent_crawls,
                    }),
                ));
            }
            Err(e) => {
                warn!("stats snapshot failed: {}", e);
                self.bus.publish(EngineEvent::error(
                    "metadata-monitor",
                    &e.to_string(),
                    json!({"query": "snapshot"}),
                ));
            }
        }
    }
}
