use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use context_core::{EngineEvent, Topic};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const SUBSCRIBER_BUFFER: usize = 256;
const COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// What one subscriber wants to see.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub project: Option<String>,
    pub topics: HashSet<Topic>,
}

impl SubscriptionFilter {
    pub fn new(project: Option<String>, topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            project,
            topics: topics.into_iter().collect(),
        }
    }

    /// Delivery rules, applied in order: project scoping first
    /// (broadcasts pass), then topic membership.
    pub fn accepts(&self, event: &EngineEvent) -> bool {
        if let (Some(wanted), false) = (self.project.as_deref(), event.is_broadcast()) {
            if event.project.as_deref() != Some(wanted) {
                return false;
            }
        }
        if !self.topics.is_empty() && !self.topics.contains(&event.topic) {
            return false;
        }
        true
    }
}

struct Subscriber {
    id: Uuid,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<EngineEvent>,
}

/// In-process pub/sub with per-subscriber project/topic filters.
/// Delivery is best-effort: a subscriber that cannot keep up loses the
/// message, producers never block. High-frequency topics are coalesced
/// at the producer side to one event per window per key.
pub struct SubscriptionBus {
    subscribers: Mutex<Vec<Subscriber>>,
    coalesced: Mutex<HashMap<String, Instant>>,
    coalesce_window: Duration,
}

impl Default for SubscriptionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::with_coalesce_window(COALESCE_WINDOW)
    }

    pub fn with_coalesce_window(window: Duration) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            coalesced: Mutex::new(HashMap::new()),
            coalesce_window: window,
        }
    }

    /// Register a subscriber. The returned receiver immediately yields
    /// a `connected` event echoing the accepted filter.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> (Uuid, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();

        let connected = EngineEvent::new(
            Topic::Connected,
            json!({
                "project": filter.project,
                "topics": filter.topics.iter().map(Topic::as_str).collect::<Vec<_>>(),
            }),
        );
        let _ = tx.try_send(connected);

        self.subscribers.lock().unwrap().push(Subscriber {
            id,
            filter,
            tx,
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Publish one event. Returns how many subscribers it reached.
    pub fn publish(&self, event: EngineEvent) -> usize {
        if self.is_coalesced_away(&event) {
            return 0;
        }

        // Snapshot under the lock, send outside it.
        let targets: Vec<(Uuid, mpsc::Sender<EngineEvent>)> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .iter()
                .filter(|s| s.filter.accepts(&event))
                .map(|s| (s.id, s.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow subscriber: drop this message for them only.
                    debug!("subscriber {} lagging, dropping {}", id, event.topic.as_str());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            self.subscribers
                .lock()
                .unwrap()
                .retain(|s| !dead.contains(&s.id));
        }
        delivered
    }

    /// Rate-limit `crawl:progress` and `postgres:stats` per
    /// `(type, project, session)` key.
    fn is_coalesced_away(&self, event: &EngineEvent) -> bool {
        if !matches!(event.topic, Topic::CrawlProgress | Topic::PostgresStats) {
            return false;
        }
        let key = event.coalesce_key();
        let now = Instant::now();
        let mut coalesced = self.coalesced.lock().unwrap();
        match coalesced.get(&key) {
            Some(last) if now.duration_since(*last) < self.coalesce_window => true,
            _ => {
                coalesced.insert(key, now);
                // Stop the key map from growing without bound.
                if coalesced.len() > 4096 {
                    let window = self.coalesce_window;
                    coalesced.retain(|_, t| now.duration_since(*t) < window);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: Topic, project: Option<&str>) -> EngineEvent {
        match project {
            Some(p) => EngineEvent::for_project(topic, p, json!({})),
            None => EngineEvent::new(topic, json!({})),
        }
    }

    async fn drain_connected(rx: &mut mpsc::Receiver<EngineEvent>) {
        let connected = rx.recv().await.unwrap();
        assert_eq!(connected.topic, Topic::Connected);
    }

    #[tokio::test]
    async fn project_and_topic_filtering() {
        let bus = SubscriptionBus::new();
        let (_, mut rx) = bus.subscribe(SubscriptionFilter::new(
            Some("alpha".to_string()),
            [Topic::WatchSync],
        ));
        drain_connected(&mut rx).await;

        // Wrong project, wrong topic, then a match.
        bus.publish(event(Topic::WatchSync, Some("beta")));
        bus.publish(event(Topic::Error, Some("alpha")));
        let delivered = bus.publish(event(Topic::WatchSync, Some("alpha")));
        assert_eq!(delivered, 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic, Topic::WatchSync);
        assert_eq!(received.project.as_deref(), Some("alpha"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcasts_bypass_project_filter() {
        let bus = SubscriptionBus::new();
        let (_, mut rx) =
            bus.subscribe(SubscriptionFilter::new(Some("alpha".to_string()), []));
        drain_connected(&mut rx).await;

        assert_eq!(bus.publish(event(Topic::Error, Some("all"))), 1);
        assert_eq!(bus.publish(event(Topic::Error, None)), 1);
        assert_eq!(rx.recv().await.unwrap().project.as_deref(), Some("all"));
        assert!(rx.recv().await.unwrap().project.is_none());
    }

    #[tokio::test]
    async fn empty_topic_set_receives_everything() {
        let bus = SubscriptionBus::new();
        let (_, mut rx) = bus.subscribe(SubscriptionFilter::default());
        drain_connected(&mut rx).await;

        bus.publish(event(Topic::WatchSync, Some("alpha")));
        bus.publish(event(Topic::Error, None));
        assert_eq!(rx.recv().await.unwrap().topic, Topic::WatchSync);
        assert_eq!(rx.recv().await.unwrap().topic, Topic::Error);
    }

    #[tokio::test]
    async fn high_frequency_topics_are_coalesced() {
        let bus = SubscriptionBus::with_coalesce_window(Duration::from_millis(200));
        let (_, mut rx) = bus.subscribe(SubscriptionFilter::default());
        drain_connected(&mut rx).await;

        let progress = || {
            EngineEvent::for_project(Topic::CrawlProgress, "alpha", json!({}))
                .with_session("cs-1")
        };
        assert_eq!(bus.publish(progress()), 1);
        assert_eq!(bus.publish(progress()), 0);

        // A different session is a different coalescing key.
        let other =
            EngineEvent::for_project(Topic::CrawlProgress, "alpha", json!({})).with_session("cs-2");
        assert_eq!(bus.publish(other), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(bus.publish(progress()), 1);
    }

    #[tokio::test]
    async fn slow_subscribers_never_block_publishers() {
        let bus = SubscriptionBus::new();
        let (_, mut rx) = bus.subscribe(SubscriptionFilter::default());
        drain_connected(&mut rx).await;

        // Flood well past the buffer; publish must keep returning.
        for _ in 0..(SUBSCRIBER_BUFFER + 100) {
            bus.publish(event(Topic::WatchEvent, None));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_BUFFER);
        assert!(received > 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let bus = SubscriptionBus::new();
        let (id, rx) = bus.subscribe(SubscriptionFilter::default());
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);

        bus.publish(event(Topic::Error, None));
        assert_eq!(bus.subscriber_count(), 0);

        // Unsubscribing an already-pruned id is harmless.
        bus.unsubscribe(id);
    }
}
