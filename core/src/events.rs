use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topics a subscriber can filter on. The wire names use the
/// `source:kind` convention expected by downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "postgres:stats")]
    PostgresStats,
    #[serde(rename = "crawl:progress")]
    CrawlProgress,
    #[serde(rename = "qdrant:stats")]
    VectorStats,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "watch:sync")]
    WatchSync,
    #[serde(rename = "watch:error")]
    WatchError,
    #[serde(rename = "watch:event")]
    WatchEvent,
    #[serde(rename = "connected")]
    Connected,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::PostgresStats => "postgres:stats",
            Topic::CrawlProgress => "crawl:progress",
            Topic::VectorStats => "qdrant:stats",
            Topic::Error => "error",
            Topic::WatchSync => "watch:sync",
            Topic::WatchError => "watch:error",
            Topic::WatchEvent => "watch:event",
            Topic::Connected => "connected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "postgres:stats" => Some(Topic::PostgresStats),
            "crawl:progress" => Some(Topic::CrawlProgress),
            "qdrant:stats" => Some(Topic::VectorStats),
            "error" => Some(Topic::Error),
            "watch:sync" => Some(Topic::WatchSync),
            "watch:error" => Some(Topic::WatchError),
            "watch:event" => Some(Topic::WatchEvent),
            "connected" => Some(Topic::Connected),
            _ => None,
        }
    }
}

/// The outbound event envelope pushed onto the subscription bus.
/// `project = "all"` marks a broadcast that bypasses project filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub topic: Topic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EngineEvent {
    pub fn new(topic: Topic, data: serde_json::Value) -> Self {
        Self {
            topic,
            project: None,
            session_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn for_project(topic: Topic, project: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic,
            project: Some(project.into()),
            session_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Typed error event emitted by monitors and watchers that swallow
    /// their own failures.
    pub fn error(source: &str, message: &str, details: serde_json::Value) -> Self {
        Self::new(
            Topic::Error,
            serde_json::json!({
                "source": source,
                "message": message,
                "details": details,
            }),
        )
    }

    /// Whether this event is addressed to every subscriber regardless of
    /// their project filter.
    pub fn is_broadcast(&self) -> bool {
        match self.project.as_deref() {
            None => true,
            Some(p) => p == "all",
        }
    }

    /// Key used for producer-side coalescing of high-frequency topics.
    pub fn coalesce_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.topic.as_str(),
            self.project.as_deref().unwrap_or(""),
            self.session_id.as_deref().unwrap_or("")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wire_names() {
        assert_eq!(Topic::PostgresStats.as_str(), "postgres:stats");
        assert_eq!(Topic::parse("qdrant:stats"), Some(Topic::VectorStats));
        assert_eq!(Topic::parse("bogus"), None);
    }

    #[test]
    fn envelope_serializes_type_field() {
        let event = EngineEvent::for_project(
            Topic::WatchSync,
            "alpha",
            serde_json::json!({"filesChanged": 3}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "watch:sync");
        assert_eq!(value["project"], "alpha");
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn broadcast_detection() {
        let scoped = EngineEvent::for_project(Topic::Error, "alpha", serde_json::Value::Null);
        assert!(!scoped.is_broadcast());
        let all = EngineEvent::for_project(Topic::Error, "all", serde_json::Value::Null);
        assert!(all.is_broadcast());
        let unaddressed = EngineEvent::new(Topic::Error, serde_json::Value::Null);
        assert!(unaddressed.is_broadcast());
    }
}
