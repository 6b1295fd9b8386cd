use async_trait::async_trait;
use context_core::{ChunkPayload, Result, SourceType, SparseVector, VectorDocument};
use uuid::Uuid;

pub mod memory;
pub mod pg;
pub mod remote;

pub use memory::MemoryVectorStore;
pub use pg::PgVectorStore;
pub use remote::RemoteVectorStore;

/// Payload-level constraints applied to search and delete operations.
/// An empty `dataset_ids` list means unconstrained; the query planner
/// always populates it with the accessible set.
#[derive(Debug, Clone, Default)]
pub struct PayloadFilter {
    pub project_id: Option<Uuid>,
    pub dataset_ids: Vec<Uuid>,
    pub relative_path: Option<String>,
    pub path_prefix: Option<String>,
    pub source_type: Option<SourceType>,
    pub repo: Option<String>,
    pub lang: Option<String>,
}

impl PayloadFilter {
    pub fn for_dataset(project_id: Uuid, dataset_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            dataset_ids: vec![dataset_id],
            ..Self::default()
        }
    }

    pub fn with_path(mut self, relative_path: impl Into<String>) -> Self {
        self.relative_path = Some(relative_path.into());
        self
    }

    /// In-process evaluation of the filter, used by the memory store
    /// and as the planner's final visibility check.
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        if let Some(project_id) = self.project_id {
            if payload.project_id != project_id {
                return false;
            }
        }
        if !self.dataset_ids.is_empty() && !self.dataset_ids.contains(&payload.dataset_id) {
            return false;
        }
        if let Some(path) = &self.relative_path {
            if &payload.relative_path != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !payload.relative_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(source_type) = self.source_type {
            if payload.source_type != source_type {
                return false;
            }
        }
        if let Some(repo) = &self.repo {
            if payload.repo.as_deref() != Some(repo.as_str()) {
                return false;
            }
        }
        if let Some(lang) = &self.lang {
            if payload.lang.as_deref() != Some(lang.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One search request against one collection.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub sparse: Option<SparseVector>,
    /// Raw query text, the lexical leg for stores that rank text
    /// directly instead of consuming sparse vectors.
    pub text: Option<String>,
    pub limit: usize,
    pub filter: PayloadFilter,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    pub score: f32,
    pub payload: ChunkPayload,
}

/// Hybrid results: a store either fuses natively (remote rank fusion)
/// or returns both legs for the planner to fuse.
#[derive(Debug, Clone)]
pub enum HybridHits {
    Fused(Vec<ScoredPoint>),
    Split {
        dense: Vec<ScoredPoint>,
        sparse: Vec<ScoredPoint>,
    },
}

/// The vector store contract. Consumers depend only on this trait;
/// capability flags gate hybrid/named-vector feature code.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn supports_hybrid(&self) -> bool;
    fn supports_named_vectors(&self) -> bool;

    async fn create_collection(&self, name: &str, dimension: usize, hybrid: bool) -> Result<()>;
    async fn drop_collection(&self, name: &str) -> Result<()>;
    async fn has_collection(&self, name: &str) -> Result<bool>;
    async fn list_collections(&self) -> Result<Vec<String>>;
    async fn count(&self, name: &str) -> Result<u64>;

    async fn upsert(&self, name: &str, documents: Vec<VectorDocument>) -> Result<()>;
    async fn delete_by_ids(&self, name: &str, ids: &[Uuid]) -> Result<()>;
    async fn delete_by_filter(&self, name: &str, filter: &PayloadFilter) -> Result<()>;

    /// Rename support: rewrite `relative_path` on every payload the
    /// filter matches, without touching vectors.
    async fn update_relative_path(
        &self,
        name: &str,
        filter: &PayloadFilter,
        new_path: &str,
    ) -> Result<()>;

    /// Dense ANN search with payload filtering.
    async fn search(&self, name: &str, query: &VectorQuery) -> Result<Vec<ScoredPoint>>;

    /// Hybrid search. The default degrades to dense-only for stores
    /// without a sparse leg.
    async fn hybrid_search(&self, name: &str, query: &VectorQuery) -> Result<HybridHits> {
        Ok(HybridHits::Fused(self.search(name, query).await?))
    }
}

/// Cosine similarity, the score convention every implementation uses.
pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Sparse dot product over sorted index lists.
pub(crate) fn sparse_dot(a: &SparseVector, b: &SparseVector) -> f32 {
    let mut score = 0.0f32;
    let mut i = 0;
    let mut j = 0;
    while i < a.indices.len() && j < b.indices.len() {
        match a.indices[i].cmp(&b.indices[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                score += a.values[i] * b.values[j];
                i += 1;
                j += 1;
            }
        }
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(project: Uuid, dataset: Uuid, path: &str) -> ChunkPayload {
        ChunkPayload {
            content: "fn main() {}".to_string(),
            relative_path: path.to_string(),
            start_line: 1,
            end_line: 1,
            file_extension: Some("rs".to_string()),
            project_id: project,
            dataset_id: dataset,
            source_type: SourceType::Local,
            repo: None,
            branch: None,
            sha: None,
            lang: Some("rust".to_string()),
            symbol: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn filter_scopes_by_dataset() {
        let project = Uuid::new_v4();
        let dataset = Uuid::new_v4();
        let filter = PayloadFilter::for_dataset(project, dataset);
        assert!(filter.matches(&payload(project, dataset, "a.rs")));
        assert!(!filter.matches(&payload(project, Uuid::new_v4(), "a.rs")));
        assert!(!filter.matches(&payload(Uuid::new_v4(), dataset, "a.rs")));
    }

    #[test]
    fn filter_path_and_prefix() {
        let project = Uuid::new_v4();
        let dataset = Uuid::new_v4();
        let exact = PayloadFilter::for_dataset(project, dataset).with_path("src/a.rs");
        assert!(exact.matches(&payload(project, dataset, "src/a.rs")));
        assert!(!exact.matches(&payload(project, dataset, "src/b.rs")));

        let prefix = PayloadFilter {
            path_prefix: Some("src/".to_string()),
            ..PayloadFilter::default()
        };
        assert!(prefix.matches(&payload(project, dataset, "src/a.rs")));
        assert!(!prefix.matches(&payload(project, dataset, "lib/a.rs")));
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn sparse_dot_aligns_indices() {
        let a = SparseVector {
            indices: vec![1, 5, 9],
            values: vec![1.0, 2.0, 3.0],
        };
        let b = SparseVector {
            indices: vec![5, 9, 11],
            values: vec![4.0, 5.0, 6.0],
        };
        assert!((sparse_dot(&a, &b) - 23.0).abs() < 1e-6);
    }
}
