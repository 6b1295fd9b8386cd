use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use context_core::{EngineError, EngineEvent, Topic};
use ingestion::CrawlerClient;
use serde_json::json;
use storage::CrawlSessionStore;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::SubscriptionBus;

/// Sessions the monitor is currently following.
#[derive(Debug, Clone)]
pub struct TrackedCrawl {
    pub project: String,
    pub dataset: String,
    pub dataset_id: Uuid,
}

/// Polls the crawler's progress endpoint per tracked session (~1 Hz),
/// emits `crawl:progress`, keeps the session rows in step, and drops
/// sessions when they reach a terminal status.
pub struct CrawlMonitor {
    client: Arc<CrawlerClient>,
    sessions: Arc<CrawlSessionStore>,
    bus: Arc<SubscriptionBus>,
    interval: Duration,
    tracked: Mutex<HashMap<String, TrackedCrawl>>,
}

impl CrawlMonitor {
    pub fn new(
        client: Arc<CrawlerClient>,
        sessions: Arc<CrawlSessionStore>,
        bus: Arc<SubscriptionBus>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            sessions,
            bus,
            interval,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, session_id: impl Into<String>, info: TrackedCrawl) {
        self.tracked.lock().unwrap().insert(session_id.into(), info);
    }

    pub fn untrack(&self, session_id: &str) {
        self.tracked.lock().unwrap().remove(session_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("crawl monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("crawl monitor stopped");
    }

    async fn tick(&self) {
        let snapshot: Vec<(String, TrackedCrawl)> = self
            .tracked
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (session_id, info) in snapshot {
            match self.client.progress(&session_id).await {
                Ok(progress) => {
                    self.bus.publish(
                        EngineEvent::for_project(
                            Topic::CrawlProgress,
                            info.project.clone(),
                            json!({
                                "sessionId": session_id,
                                "project": info.project,
                                "dataset": info.dataset,
                                "phase": progress.phase,
                                "currentPhase": progress.phase,
                                "phaseDetail": progress.phase_detail,
                                "percentage": progress.percentage,
                                "current": progress.current,
                                "total": progress.total,
                                "status": progress.status,
                                "chunksProcessed": progress.chunks_processed,
                                "chunksTotal": progress.chunks_total,
                                "summariesGenerated": progress.summaries_generated,
                                "embeddingsGenerated": progress.embeddings_generated,
                            }),
                        )
                        .with_session(session_id.clone()),
                    );

                    if let Err(e) = self
                        .sessions
                        .sync_progress(
                            info.dataset_id,
                            &session_id,
                            &progress.status,
                            progress.current as i32,
                            0,
                            json!({
                                "phase": progress.phase,
                                "progress": progress.percentage,
                                "phase_detail": progress.phase_detail,
                            }),
                        )
                        .await
                    {
                        warn!(session = %session_id, "session row sync failed: {}", e);
                    }

                    if progress.is_terminal() {
                        info!(session = %session_id, status = %progress.status, "crawl finished");
                        self.untrack(&session_id);
                    }
                }
                Err(EngineError::NotFound(_)) => {
                    // The crawler forgot the session; stop following it.
                    warn!(session = %session_id, "session unknown to crawler, dropping");
                    self.untrack(&session_id);
                }
                Err(e) => {
                    self.bus.publish(EngineEvent::error(
                        "crawl-monitor",
                        &e.to_string(),
                        json!({"sessionId": session_id}),
                    ));
                }
            }
        }
    }
}
