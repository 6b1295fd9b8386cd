use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use context_core::{EngineError, Result, VectorDocument};
use uuid::Uuid;

use super::{cosine, sparse_dot, HybridHits, PayloadFilter, ScoredPoint, VectorQuery, VectorStore};

struct Collection {
    dimension: usize,
    hybrid: bool,
    points: HashMap<Uuid, VectorDocument>,
}

/// In-process vector store. Backs engine-level tests and ephemeral
/// runs; brute-force cosine is fine at that scale.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_collection<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Collection) -> Result<T>,
    ) -> Result<T> {
        let mut collections = self.collections.lock().unwrap();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("collection '{name}'")))?;
        f(collection)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn supports_hybrid(&self) -> bool {
        true
    }

    fn supports_named_vectors(&self) -> bool {
        true
    }

    async fn create_collection(&self, name: &str, dimension: usize, hybrid: bool) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        collections.entry(name.to_string()).or_insert(Collection {
            dimension,
            hybrid,
            points: HashMap::new(),
        });
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.collections.lock().unwrap().remove(name);
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.collections.lock().unwrap().contains_key(name))
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.collections.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn count(&self, name: &str) -> Result<u64> {
        self.with_collection(name, |c| Ok(c.points.len() as u64))
    }

    async fn upsert(&self, name: &str, documents: Vec<VectorDocument>) -> Result<()> {
        self.with_collection(name, |c| {
            for doc in documents {
                if doc.vector.len() != c.dimension {
                    return Err(EngineError::conflict(format!(
                        "vector dimension {} does not match collection dimension {}",
                        doc.vector.len(),
                        c.dimension
                    )));
                }
                c.points.insert(doc.id, doc);
            }
            Ok(())
        })
    }

    async fn delete_by_ids(&self, name: &str, ids: &[Uuid]) -> Result<()> {
        self.with_collection(name, |c| {
            for id in ids {
                c.points.remove(id);
            }
            Ok(())
        })
    }

    async fn delete_by_filter(&self, name: &str, filter: &PayloadFilter) -> Result<()> {
        self.with_collection(name, |c| {
            c.points.retain(|_, doc| !filter.matches(&doc.payload));
            Ok(())
        })
    }

    async fn update_relative_path(
        &self,
        name: &str,
        filter: &PayloadFilter,
        new_path: &str,
    ) -> Result<()> {
        self.with_collection(name, |c| {
            for doc in c.points.values_mut() {
                if filter.matches(&doc.payload) {
                    doc.payload.relative_path = new_path.to_string();
                }
            }
            Ok(())
        })
    }

    async fn search(&self, name: &str, query: &VectorQuery) -> Result<Vec<ScoredPoint>> {
        self.with_collection(name, |c| {
            let mut hits: Vec<ScoredPoint> = c
                .points
                .values()
                .filter(|doc| query.filter.matches(&doc.payload))
                .map(|doc| ScoredPoint {
                    id: doc.id,
                    score: cosine(&query.vector, &doc.vector),
                    payload: doc.payload.clone(),
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(query.limit);
            Ok(hits)
        })
    }

    async fn hybrid_search(&self, name: &str, query: &VectorQuery) -> Result<HybridHits> {
        let dense = self.search(name, query).await?;
        let Some(query_sparse) = &query.sparse else {
            return Ok(HybridHits::Fused(dense));
        };
        let sparse = self.with_collection(name, |c| {
            if !c.hybrid {
                return Ok(Vec::new());
            }
            let mut hits: Vec<ScoredPoint> = c
                .points
                .values()
                .filter(|doc| query.filter.matches(&doc.payload))
                .filter_map(|doc| {
                    let doc_sparse = doc.sparse.as_ref()?;
                    let score = sparse_dot(query_sparse, doc_sparse);
                    (score > 0.0).then(|| ScoredPoint {
                        id: doc.id,
                        score,
                        payload: doc.payload.clone(),
                    })
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(query.limit);
            Ok(hits)
        })?;
        Ok(HybridHits::Split { dense, sparse })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_core::{ChunkPayload, SourceType, SparseVector};

    fn doc(project: Uuid, dataset: Uuid, path: &str, vector: Vec<f32>) -> VectorDocument {
        VectorDocument {
            id: Uuid::new_v4(),
            vector,
            summary_vector: None,
            sparse: Some(SparseVector {
                indices: vec![1, 2],
                values: vec![1.0, 1.0],
            }),
            payload: ChunkPayload {
                content: "content".to_string(),
                relative_path: path.to_string(),
                start_line: 1,
                end_line: 2,
                file_extension: None,
                project_id: project,
                dataset_id: dataset,
                source_type: SourceType::Local,
                repo: None,
                branch: None,
                sha: None,
                lang: None,
                symbol: None,
                metadata: serde_json::Value::Null,
            },
        }
    }

    #[tokio::test]
    async fn search_respects_filter_and_order() {
        let store = MemoryVectorStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        let project = Uuid::new_v4();
        let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());
        store
            .upsert(
                "c",
                vec![
                    doc(project, d1, "close.rs", vec![1.0, 0.0]),
                    doc(project, d1, "far.rs", vec![0.0, 1.0]),
                    doc(project, d2, "other.rs", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search(
                "c",
                &VectorQuery {
                    vector: vec![1.0, 0.0],
                    sparse: None,
                    text: None,
                    limit: 10,
                    filter: PayloadFilter::for_dataset(project, d1),
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.relative_path, "close.rs");
        assert!(hits.iter().all(|h| h.payload.dataset_id == d1));
    }

    #[tokio::test]
    async fn delete_by_filter_and_rename() {
        let store = MemoryVectorStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        let project = Uuid::new_v4();
        let dataset = Uuid::new_v4();
        store
            .upsert(
                "c",
                vec![
                    doc(project, dataset, "old.rs", vec![1.0, 0.0]),
                    doc(project, dataset, "keep.rs", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let rename = PayloadFilter::for_dataset(project, dataset).with_path("old.rs");
        store.update_relative_path("c", &rename, "new.rs").await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 2);

        let delete = PayloadFilter::for_dataset(project, dataset).with_path("keep.rs");
        store.delete_by_filter("c", &delete).await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 1);

        let hits = store
            .search(
                "c",
                &VectorQuery {
                    vector: vec![1.0, 0.0],
                    sparse: None,
                    text: None,
                    limit: 10,
                    filter: PayloadFilter::default(),
                },
            )
            .await
            .unwrap();
        assert_eq!(hits[0].payload.relative_path, "new.rs");
    }

    #[tokio::test]
    async fn dimension_mismatch_is_conflict() {
        let store = MemoryVectorStore::new();
        store.create_collection("c", 4, false).await.unwrap();
        let err = store
            .upsert("c", vec![doc(Uuid::new_v4(), Uuid::new_v4(), "a.rs", vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn hybrid_returns_both_legs() {
        let store = MemoryVectorStore::new();
        store.create_collection("c", 2, true).await.unwrap();
        let project = Uuid::new_v4();
        let dataset = Uuid::new_v4();
        store
            .upsert("c", vec![doc(project, dataset, "a.rs", vec![1.0, 0.0])])
            .await
            .unwrap();

        let hits = store
            .hybrid_search(
                "c",
                &VectorQuery {
                    vector: vec![1.0, 0.0],
                    sparse: Some(SparseVector {
                        indices: vec![2, 3],
                        values: vec![1.0, 1.0],
                    }),
                    text: None,
                    limit: 10,
                    filter: PayloadFilter::default(),
                },
            )
            .await
            .unwrap();
        match hits {
            HybridHits::Split { dense, sparse } => {
                assert_eq!(dense.len(), 1);
                assert_eq!(sparse.len(), 1);
            }
            HybridHits::Fused(_) => panic!("expected split hybrid hits"),
        }
    }
}
