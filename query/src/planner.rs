use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use context_core::{Dataset, EngineError, Result, SourceType};
use embeddings::{Embedder, SparseEncoder};
use serde::Serialize;
use storage::{
    collection_name_for, CollectionRead, HybridHits, PayloadFilter, ScopeRead, VectorQuery,
    VectorStore,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::fusion::{self, Candidate};
use crate::patterns::PatternSet;

/// Optional second-stage scorer over the top-K candidates.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Scores aligned with `candidates` order, higher is better.
    async fn rerank(&self, query: &str, candidates: &[(Uuid, String)]) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone)]
pub enum DatasetSelector {
    One(String),
    Many(Vec<String>),
}

impl DatasetSelector {
    fn tokens(&self) -> Vec<String> {
        match self {
            DatasetSelector::One(name) => vec![name.clone()],
            DatasetSelector::Many(names) => names.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub source_type: Option<SourceType>,
    pub repo: Option<String>,
    pub path_prefix: Option<String>,
    pub lang: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub project: String,
    pub datasets: Option<DatasetSelector>,
    pub query: String,
    pub top_k: usize,
    pub filters: Option<SearchFilters>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultChunk {
    pub id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultScores {
    pub vector: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank: Option<f32>,
    pub r#final: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDataset {
    pub project: String,
    pub dataset: String,
    pub dataset_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSource {
    pub relative_path: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk: ResultChunk,
    pub scores: ResultScores,
    pub dataset: ResultDataset,
    pub source: ResultSource,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingMs {
    pub embedding: u64,
    pub search: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMetadata {
    pub retrieval_method: String,
    pub timing_ms: TimingMs,
    pub queries_executed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub request_id: Uuid,
    pub results: Vec<SearchResult>,
    pub metadata: SearchMetadata,
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub enable_hybrid: bool,
    pub oversample_factor: usize,
    pub timeout: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enable_hybrid: false,
            oversample_factor: 3,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Expands dataset selectors, enforces visibility, fans out vector
/// search per collection, and fuses results into one ranked list.
pub struct QueryPlanner {
    scope: Arc<dyn ScopeRead>,
    collections: Arc<dyn CollectionRead>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    sparse: Option<Arc<dyn SparseEncoder>>,
    reranker: Option<Arc<dyn Reranker>>,
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(
        scope: Arc<dyn ScopeRead>,
        collections: Arc<dyn CollectionRead>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        sparse: Option<Arc<dyn SparseEncoder>>,
        reranker: Option<Arc<dyn Reranker>>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            scope,
            collections,
            store,
            embedder,
            sparse,
            reranker,
            config,
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let request_id = Uuid::new_v4();

        // Unknown projects yield empty results, not errors.
        let Some(project) = self.scope.project_by_name(&request.project).await? else {
            debug!(project = %request.project, "query against unknown project");
            return Ok(empty_response(request_id, started));
        };

        let accessible = self.scope.visible_datasets(project.id).await?;
        let selected = self.select_datasets(&request, &accessible)?;
        if selected.is_empty() {
            return Ok(empty_response(request_id, started));
        }
        let accessible_ids: HashSet<Uuid> = accessible.iter().map(|d| d.id).collect();

        // Embed once for the whole fan-out.
        let embed_started = Instant::now();
        let query_vector = self.embedder.embed(&request.query).await?;
        let hybrid = self.config.enable_hybrid && self.store.supports_hybrid();
        let query_sparse = if hybrid {
            self.sparse.as_ref().map(|s| s.encode(&request.query))
        } else {
            None
        };
        let embedding_ms = embed_started.elapsed().as_millis() as u64;

        let search_started = Instant::now();
        let per_collection_limit = request.top_k.max(1) * self.config.oversample_factor;
        let mut queries_executed = 0usize;

        let searches = selected.iter().map(|dataset| {
            let vector = query_vector.clone();
            let sparse = query_sparse.clone();
            let filters = request.filters.clone();
            let text = request.query.clone();
            async move {
                let collection = match self.collection_of(dataset).await {
                    Ok(Some(collection)) => collection,
                    Ok(None) => return None,
                    Err(e) => {
                        warn!(dataset = %dataset.name, "collection lookup failed: {}", e);
                        return None;
                    }
                };
                let query = VectorQuery {
                    vector,
                    sparse,
                    text: Some(text),
                    limit: per_collection_limit,
                    filter: dataset_filter(dataset, filters.as_ref()),
                };
                let outcome = tokio::time::timeout(self.config.timeout, async {
                    if hybrid {
                        self.store.hybrid_search(&collection, &query).await
                    } else {
                        self.store.search(&collection, &query).await.map(HybridHits::Fused)
                    }
                })
                .await;
                match outcome {
                    Ok(Ok(hits)) => Some((dataset.clone(), hits)),
                    Ok(Err(e)) => {
                        // Partial results: a failing collection drops out.
                        warn!(dataset = %dataset.name, "collection search failed: {}", e);
                        None
                    }
                    Err(_) => {
                        warn!(dataset = %dataset.name, "collection search timed out");
                        None
                    }
                }
            }
        });
        let outcomes = futures::future::join_all(searches).await;

        let mut per_collection: Vec<Vec<Candidate>> = Vec::new();
        let mut dataset_names: HashMap<Uuid, String> = HashMap::new();
        for outcome in outcomes.into_iter().flatten() {
            let (dataset, hits) = outcome;
            queries_executed += 1;
            dataset_names.insert(dataset.id, dataset.name.clone());
            let candidates = match hits {
                HybridHits::Fused(points) => points.into_iter().map(Candidate::dense).collect(),
                HybridHits::Split { dense, sparse } => {
                    fusion::fuse_reciprocal_rank(dense, sparse)
                }
            };
            per_collection.push(candidates);
        }
        let search_ms = search_started.elapsed().as_millis() as u64;

        let mut merged = fusion::merge_top_k(per_collection, request.top_k.max(1));
        // The result set never leaks a chunk outside the accessible set.
        merged.retain(|c| accessible_ids.contains(&c.point.payload.dataset_id));

        let mut reranked = false;
        if let Some(reranker) = &self.reranker {
            if !merged.is_empty() {
                let inputs: Vec<(Uuid, String)> = merged
                    .iter()
                    .map(|c| (c.point.id, c.point.payload.content.clone()))
                    .collect();
                match reranker.rerank(&request.query, &inputs).await {
                    Ok(scores) if scores.len() == merged.len() => {
                        for (candidate, score) in merged.iter_mut().zip(scores) {
                            candidate.rerank_score = Some(score);
                            candidate.final_score = score;
                        }
                        merged.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
                        reranked = true;
                    }
                    Ok(_) => warn!("reranker returned a mismatched score count, skipping"),
                    Err(e) => warn!("reranker failed, keeping fused order: {}", e),
                }
            }
        }

        let mut results = Vec::with_capacity(merged.len());
        for candidate in merged {
            let payload = &candidate.point.payload;
            let dataset_name = dataset_names
                .get(&payload.dataset_id)
                .cloned()
                .unwrap_or_default();
            let owner = self
                .scope
                .project_name(payload.project_id)
                .await?
                .unwrap_or_else(|| request.project.clone());
            results.push(SearchResult {
                chunk: ResultChunk {
                    id: candidate.point.id,
                    content: payload.content.clone(),
                },
                scores: ResultScores {
                    vector: candidate.vector_score,
                    sparse: candidate.sparse_score,
                    rerank: candidate.rerank_score,
                    r#final: candidate.final_score,
                },
                dataset: ResultDataset {
                    project: owner,
                    dataset: dataset_name,
                    dataset_id: payload.dataset_id,
                },
                source: ResultSource {
                    relative_path: payload.relative_path.clone(),
                    start_line: payload.start_line,
                    end_line: payload.end_line,
                    repo: payload.repo.clone(),
                    branch: payload.branch.clone(),
                },
            });
        }

        let retrieval_method = match (hybrid, reranked) {
            (true, true) => "hybrid+rerank",
            (true, false) => "hybrid",
            (false, true) => "dense+rerank",
            (false, false) => "dense",
        };

        Ok(SearchResponse {
            request_id,
            results,
            metadata: SearchMetadata {
                retrieval_method: retrieval_method.to_string(),
                timing_ms: TimingMs {
                    embedding: embedding_ms,
                    search: search_ms,
                    total: started.elapsed().as_millis() as u64,
                },
                queries_executed,
            },
        })
    }

    /// Expand the selector against the accessible set. A selector that
    /// matches nothing is a validation error carrying the accessible
    /// names as suggestions.
    fn select_datasets(
        &self,
        request: &SearchRequest,
        accessible: &[Dataset],
    ) -> Result<Vec<Dataset>> {
        let tokens = request.datasets.as_ref().map(DatasetSelector::tokens);
        let set = PatternSet::parse(tokens.as_deref())?;

        for name in set.exact_names() {
            if !accessible.iter().any(|d| d.name == name) {
                warn!(dataset = name, "requested dataset is not accessible, dropping");
            }
        }

        let selected: Vec<Dataset> = accessible
            .iter()
            .filter(|d| set.matches(&d.name))
            .cloned()
            .collect();

        if selected.is_empty() && tokens.is_some() {
            return Err(EngineError::validation(
                "no accessible dataset matches the requested pattern",
                accessible.iter().map(|d| d.name.clone()).collect(),
            ));
        }
        Ok(selected)
    }

    /// The dataset's collection name: registry row when present,
    /// otherwise the deterministic name checked against the store's
    /// collection list (not yet materialised collections are skipped).
    async fn collection_of(&self, dataset: &Dataset) -> Result<Option<String>> {
        if let Some(row) = self.collections.collection_for(dataset.id).await? {
            return Ok(Some(row.collection_name));
        }
        let derived = collection_name_for(dataset.project_id, dataset.id, dataset.scope);
        let known = self.store.list_collections().await?;
        if known.contains(&derived) {
            Ok(Some(derived))
        } else {
            debug!(dataset = %dataset.name, "collection not materialised, skipping");
            Ok(None)
        }
    }
}

fn dataset_filter(dataset: &Dataset, filters: Option<&SearchFilters>) -> PayloadFilter {
    let mut filter = PayloadFilter::for_dataset(dataset.project_id, dataset.id);
    if let Some(filters) = filters {
        filter.source_type = filters.source_type;
        filter.repo = filters.repo.clone();
        filter.path_prefix = filters.path_prefix.clone();
        filter.lang = filters.lang.clone();
    }
    filter
}

fn empty_response(request_id: Uuid, started: Instant) -> SearchResponse {
    SearchResponse {
        request_id,
        results: Vec::new(),
        metadata: SearchMetadata {
            retrieval_method: "none".to_string(),
            timing_ms: TimingMs {
                embedding: 0,
                search: 0,
                total: started.elapsed().as_millis() as u64,
            },
            queries_executed: 0,
        },
    }
}
