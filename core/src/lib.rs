use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod events;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, Topic};

/// Where a piece of indexed content originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Local,
    Web,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Git => "git",
            SourceType::Local => "local",
            SourceType::Web => "web",
        }
    }
}

/// Top-level tenant scope. Created lazily on first reference, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub is_global: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Visibility default for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetScope {
    Global,
    Project,
    Local,
}

impl DatasetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetScope::Global => "global",
            DatasetScope::Project => "project",
            DatasetScope::Local => "local",
        }
    }

    /// Short suffix used in derived collection names.
    pub fn tag(&self) -> &'static str {
        match self {
            DatasetScope::Global => "g",
            DatasetScope::Project => "p",
            DatasetScope::Local => "l",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(DatasetScope::Global),
            "project" => Some(DatasetScope::Project),
            "local" => Some(DatasetScope::Local),
            _ => None,
        }
    }
}

/// A named sub-scope of a project. Unique per `(project_id, name)` and
/// mapped to exactly one vector collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub is_global: bool,
    pub scope: DatasetScope,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The single vector collection backing a dataset. `point_count` is a
/// cache refreshed after syncs and by the vector-store monitor; it is
/// never read for correctness decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetCollection {
    pub dataset_id: Uuid,
    pub collection_name: String,
    pub dimension: i32,
    pub is_hybrid: bool,
    pub point_count: i64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Per-file bookkeeping row used only by incremental sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFile {
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub relative_path: String,
    pub sha256_hash: String,
    pub file_size: i64,
    pub chunk_count: i32,
    pub language: Option<String>,
    pub collection_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Phases a repository ingestion job moves through. Workers check for
/// cancellation at every phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Clone,
    Scan,
    Chunk,
    Embed,
    Upsert,
    Finalize,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobPhase::Clone => "clone",
            JobPhase::Scan => "scan",
            JobPhase::Chunk => "chunk",
            JobPhase::Embed => "embed",
            JobPhase::Upsert => "upsert",
            JobPhase::Finalize => "finalize",
        }
    }
}

/// A queued repository ingestion job. Non-terminal rows with
/// `visible_at <= now` are dispatchable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoJob {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub repo_url: String,
    pub repo_org: String,
    pub repo_name: String,
    pub branch: String,
    pub sha: Option<String>,
    pub status: JobStatus,
    pub progress: i32,
    pub current_phase: Option<String>,
    pub current_file: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub visible_at: DateTime<Utc>,
    pub indexed_files: Option<i32>,
    pub total_chunks: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A crawl run tracked against the external crawler service, keyed by
/// `(dataset_id, external_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub external_id: String,
    pub status: String,
    pub pages_crawled: i32,
    pub pages_failed: i32,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Dataset,
    Project,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Dataset => "dataset",
            ResourceType::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dataset" => Some(ResourceType::Dataset),
            "project" => Some(ResourceType::Project),
            _ => None,
        }
    }
}

/// An explicit grant from one project to another. Self-shares are
/// rejected at the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectShare {
    pub id: Uuid,
    pub source_project_id: Uuid,
    pub target_project_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub can_read: bool,
    pub can_write: bool,
    pub created_at: DateTime<Utc>,
}

/// Sparse vector representation for hybrid retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

/// Payload stored alongside every vector point. Any point always carries
/// its `project_id` and `dataset_id` so visibility can be enforced at the
/// vector layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub content: String,
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub file_extension: Option<String>,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A point written to a vector collection: dense vector, optional summary
/// and sparse vectors, plus the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: Uuid,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse: Option<SparseVector>,
    pub payload: ChunkPayload,
}

/// Map a relative path to the language recorded on metadata rows and
/// vector payloads. Only extensions the ignore matcher admits show up
/// here, so unknown extensions just yield `None`.
pub fn language_for_path(path: &str) -> Option<&'static str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name {
        "Dockerfile" => return Some("dockerfile"),
        "Makefile" => return Some("makefile"),
        _ => {}
    }
    let ext = name.rsplit('.').next()?;
    let lang = match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "jsx" => "javascript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" | "cxx" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "yml" | "yaml" => "yaml",
        "toml" => "toml",
        "html" | "htm" => "html",
        "css" => "css",
        "proto" => "protobuf",
        _ => return None,
    };
    Some(lang)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::parse("unknown").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn language_detection() {
        assert_eq!(language_for_path("src/main.rs"), Some("rust"));
        assert_eq!(language_for_path("a/b/app.py"), Some("python"));
        assert_eq!(language_for_path("Dockerfile"), Some("dockerfile"));
        assert_eq!(language_for_path("deep/dir/Makefile"), Some("makefile"));
        assert_eq!(language_for_path("photo.png"), None);
        assert_eq!(language_for_path("noext"), None);
    }
}
