use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use context_core::error::FileError;
use context_core::{ChunkPayload, IndexedFile, Result, SourceType, VectorDocument};
use embeddings::{Chunker, Embedder, SparseEncoder};
use storage::{FileIndex, PayloadFilter, VectorStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::changes::{ChangeDetector, ChangeSummary, FileChange, RenamedFile};

/// Everything a sync needs to know about where chunks go.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub project: String,
    pub dataset: String,
    pub collection_name: String,
    pub dimension: usize,
    pub hybrid: bool,
    pub source_type: SourceType,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub sha: Option<String>,
}

/// Resolves `(project_id, dataset_id)` into a sync target. The host
/// backs this with the scope manager and collection registry; tests use
/// a fixed mapping.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, project_id: Uuid, dataset_id: Uuid) -> Result<SyncTarget>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Scanning,
    Deleting,
    Updating,
    Renaming,
    Creating,
    Complete,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Scanning => "scanning",
            SyncPhase::Deleting => "deleting",
            SyncPhase::Updating => "updating",
            SyncPhase::Renaming => "renaming",
            SyncPhase::Creating => "creating",
            SyncPhase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub current: usize,
    pub total: usize,
    pub percentage: u8,
    pub file: Option<String>,
    pub detail: Option<String>,
}

pub type ProgressFn = Arc<dyn Fn(SyncProgress) + Send + Sync>;

#[derive(Default, Clone)]
pub struct SyncOptions {
    pub force: bool,
    pub detect_renames: bool,
    pub progress: Option<ProgressFn>,
}

#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub renamed: usize,
    pub unchanged: usize,
    pub chunks_added: usize,
    pub chunks_removed: usize,
    pub errors: Vec<FileError>,
    pub duration: Duration,
}

/// Reconciles one working tree with one dataset. Invariants:
/// chunks for a modified or deleted file leave the collection before
/// replacements arrive, metadata rows change only after a successful
/// vector write, and one failing file never aborts the whole sync.
pub struct IncrementalSyncer {
    file_index: Arc<dyn FileIndex>,
    vector_store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    chunker: Arc<dyn Chunker>,
    sparse: Option<Arc<dyn SparseEncoder>>,
    detector: ChangeDetector,
}

impl IncrementalSyncer {
    pub fn new(
        file_index: Arc<dyn FileIndex>,
        vector_store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        chunker: Arc<dyn Chunker>,
        sparse: Option<Arc<dyn SparseEncoder>>,
    ) -> Self {
        Self {
            file_index,
            vector_store,
            embedder,
            chunker,
            sparse,
            detector: ChangeDetector::new(8),
        }
    }

    pub fn file_index(&self) -> &Arc<dyn FileIndex> {
        &self.file_index
    }

    pub async fn sync(
        &self,
        root: &Path,
        target: &SyncTarget,
        options: SyncOptions,
    ) -> Result<SyncStats> {
        let started = Instant::now();
        let mut stats = SyncStats::default();

        report(&options, SyncPhase::Scanning, 0, 0, None, None);

        // Touching the store up front makes an unreachable vector store
        // fail the sync before any metadata is altered.
        self.ensure_collection(target).await?;

        if options.force {
            self.file_index
                .clear_dataset(target.project_id, target.dataset_id)
                .await?;
            self.vector_store
                .delete_by_filter(
                    &target.collection_name,
                    &PayloadFilter::for_dataset(target.project_id, target.dataset_id),
                )
                .await?;
        }

        // Old chunk counts feed the removed-chunks accounting.
        let prior: HashMap<String, i32> = self
            .file_index
            .get_all(target.project_id, target.dataset_id)
            .await?
            .into_iter()
            .map(|f| (f.relative_path, f.chunk_count))
            .collect();

        let summary = self
            .detector
            .detect(
                root,
                target.project_id,
                target.dataset_id,
                self.file_index.as_ref(),
                options.detect_renames,
            )
            .await?;

        stats.unchanged = summary.unchanged.len();
        info!(
            project = %target.project,
            dataset = %target.dataset,
            created = summary.created.len(),
            modified = summary.modified.len(),
            deleted = summary.deleted.len(),
            renamed = summary.renamed.len(),
            "change plan ready"
        );

        // Fixed order: deletions, then modifications, then renames, then
        // creations, so stale chunks for a path never coexist with new ones.
        self.apply_deletions(target, &summary, &prior, &options, &mut stats)
            .await;
        self.apply_modifications(target, &summary, &prior, &options, &mut stats)
            .await;
        self.apply_renames(target, &summary, &options, &mut stats).await;
        self.apply_creations(target, &summary, &options, &mut stats).await;

        stats.duration = started.elapsed();
        report(
            &options,
            SyncPhase::Complete,
            stats.created + stats.modified + stats.deleted + stats.renamed,
            summary.total_changes(),
            None,
            Some(format!(
                "+{} -{} chunks, {} error(s)",
                stats.chunks_added,
                stats.chunks_removed,
                stats.errors.len()
            )),
        );
        Ok(stats)
    }

    async fn ensure_collection(&self, target: &SyncTarget) -> Result<()> {
        if !self.vector_store.has_collection(&target.collection_name).await? {
            self.vector_store
                .create_collection(&target.collection_name, target.dimension, target.hybrid)
                .await?;
        }
        Ok(())
    }

    async fn apply_deletions(
        &self,
        target: &SyncTarget,
        summary: &ChangeSummary,
        prior: &HashMap<String, i32>,
        options: &SyncOptions,
        stats: &mut SyncStats,
    ) {
        let total = summary.deleted.len();
        for (i, change) in summary.deleted.iter().enumerate() {
            report(
                options,
                SyncPhase::Deleting,
                i + 1,
                total,
                Some(&change.relative_path),
                None,
            );
            match self.delete_file(target, &change.relative_path).await {
                Ok(()) => {
                    stats.deleted += 1;
                    stats.chunks_removed += prior
                        .get(&change.relative_path)
                        .copied()
                        .unwrap_or(0)
                        .max(0) as usize;
                }
                Err(e) => record_error(stats, &change.relative_path, e),
            }
        }
    }

    async fn apply_modifications(
        &self,
        target: &SyncTarget,
        summary: &ChangeSummary,
        prior: &HashMap<String, i32>,
        options: &SyncOptions,
        stats: &mut SyncStats,
    ) {
        let total = summary.modified.len();
        for (i, change) in summary.modified.iter().enumerate() {
            report(
                options,
                SyncPhase::Updating,
                i + 1,
                total,
                Some(&change.relative_path),
                None,
            );
            // Delete-then-insert, strictly in that order.
            let result = async {
                self.delete_chunks(target, &change.relative_path).await?;
                self.index_file(target, change).await
            }
            .await;
            match result {
                Ok(chunks) => {
                    stats.modified += 1;
                    stats.chunks_added += chunks;
                    stats.chunks_removed += prior
                        .get(&change.relative_path)
                        .copied()
                        .unwrap_or(0)
                        .max(0) as usize;
                }
                Err(e) => record_error(stats, &change.relative_path, e),
            }
        }
    }

    async fn apply_renames(
        &self,
        target: &SyncTarget,
        summary: &ChangeSummary,
        options: &SyncOptions,
        stats: &mut SyncStats,
    ) {
        let total = summary.renamed.len();
        for (i, rename) in summary.renamed.iter().enumerate() {
            report(
                options,
                SyncPhase::Renaming,
                i + 1,
                total,
                Some(&rename.new_path),
                Some(format!("from {}", rename.old_path)),
            );
            match self.rename_file(target, rename).await {
                Ok(()) => stats.renamed += 1,
                Err(e) => record_error(stats, &rename.new_path, e),
            }
        }
    }

    async fn apply_creations(
        &self,
        target: &SyncTarget,
        summary: &ChangeSummary,
        options: &SyncOptions,
        stats: &mut SyncStats,
    ) {
        let total = summary.created.len();
        for (i, change) in summary.created.iter().enumerate() {
            report(
                options,
                SyncPhase::Creating,
                i + 1,
                total,
                Some(&change.relative_path),
                None,
            );
            match self.index_file(target, change).await {
                Ok(chunks) => {
                    stats.created += 1;
                    stats.chunks_added += chunks;
                }
                Err(e) => record_error(stats, &change.relative_path, e),
            }
        }
    }

    async fn delete_file(&self, target: &SyncTarget, relative_path: &str) -> Result<()> {
        self.delete_chunks(target, relative_path).await?;
        self.file_index
            .remove(target.project_id, target.dataset_id, relative_path)
            .await
    }

    async fn delete_chunks(&self, target: &SyncTarget, relative_path: &str) -> Result<()> {
        let filter = PayloadFilter::for_dataset(target.project_id, target.dataset_id)
            .with_path(relative_path);
        self.vector_store
            .delete_by_filter(&target.collection_name, &filter)
            .await
    }

    /// Renames touch metadata and payloads only; no chunk is re-embedded.
    async fn rename_file(&self, target: &SyncTarget, rename: &RenamedFile) -> Result<()> {
        self.file_index
            .update_path(
                target.project_id,
                target.dataset_id,
                &rename.old_path,
                &rename.new_path,
            )
            .await?;
        let filter = PayloadFilter::for_dataset(target.project_id, target.dataset_id)
            .with_path(&rename.old_path);
        self.vector_store
            .update_relative_path(&target.collection_name, &filter, &rename.new_path)
            .await
    }

    /// Read, chunk, embed, upsert, then record metadata. Returns the
    /// number of chunks written.
    async fn index_file(&self, target: &SyncTarget, change: &FileChange) -> Result<usize> {
        let content = tokio::fs::read_to_string(&change.absolute_path)
            .await
            .map_err(|e| {
                context_core::EngineError::transient(format!(
                    "read {:?}: {e}",
                    change.absolute_path
                ))
            })?;

        let chunks = self.chunker.chunk(&change.relative_path, &content);
        let documents = if chunks.is_empty() {
            debug!(file = %change.relative_path, "no chunks produced");
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            chunks
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorDocument {
                    id: Uuid::new_v4(),
                    vector,
                    summary_vector: None,
                    sparse: self
                        .sparse
                        .as_ref()
                        .filter(|_| target.hybrid)
                        .map(|encoder| encoder.encode(&chunk.content)),
                    payload: ChunkPayload {
                        content: chunk.content.clone(),
                        relative_path: change.relative_path.clone(),
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        file_extension: extension_of(&change.relative_path),
                        project_id: target.project_id,
                        dataset_id: target.dataset_id,
                        source_type: target.source_type,
                        repo: target.repo.clone(),
                        branch: target.branch.clone(),
                        sha: target.sha.clone(),
                        lang: change.language.clone(),
                        symbol: chunk.symbol.clone(),
                        metadata: serde_json::Value::Null,
                    },
                })
                .collect()
        };

        let chunk_count = documents.len();
        self.vector_store
            .upsert(&target.collection_name, documents)
            .await?;

        // Metadata last: a vector write failure leaves the row untouched
        // for the next run.
        self.file_index
            .upsert(&IndexedFile {
                project_id: target.project_id,
                dataset_id: target.dataset_id,
                relative_path: change.relative_path.clone(),
                sha256_hash: change.new_hash.clone().unwrap_or_default(),
                file_size: change.file_size as i64,
                chunk_count: chunk_count as i32,
                language: change.language.clone(),
                collection_name: Some(target.collection_name.clone()),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;
        Ok(chunk_count)
    }
}

fn record_error(stats: &mut SyncStats, path: &str, error: context_core::EngineError) {
    warn!(file = %path, "sync step failed: {}", error);
    stats.errors.push(FileError {
        path: path.to_string(),
        message: error.to_string(),
    });
}

fn report(
    options: &SyncOptions,
    phase: SyncPhase,
    current: usize,
    total: usize,
    file: Option<&str>,
    detail: Option<String>,
) {
    if let Some(progress) = &options.progress {
        let percentage = if total == 0 {
            100
        } else {
            ((current * 100) / total).min(100) as u8
        };
        progress(SyncProgress {
            phase,
            current,
            total,
            percentage,
            file: file.map(str::to_string),
            detail,
        });
    }
}

fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty()).then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use embeddings::{HashedSparseEncoder, LineChunker, MockEmbedder};
    use storage::{MemoryFileIndex, MemoryVectorStore, VectorQuery};

    fn target(collection: &str) -> SyncTarget {
        SyncTarget {
            project_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
            project: "alpha".to_string(),
            dataset: "code".to_string(),
            collection_name: collection.to_string(),
            dimension: 8,
            hybrid: false,
            source_type: SourceType::Local,
            repo: None,
            branch: None,
            sha: None,
        }
    }

    fn syncer(store: Arc<MemoryVectorStore>, index: Arc<MemoryFileIndex>) -> IncrementalSyncer {
        IncrementalSyncer::new(
            index,
            store,
            Arc::new(MockEmbedder::new(8)),
            Arc::new(LineChunker::with_config(10, 0)),
            Some(Arc::new(HashedSparseEncoder::default())),
        )
    }

    async fn all_paths(store: &MemoryVectorStore, collection: &str) -> Vec<String> {
        let hits = store
            .search(
                collection,
                &VectorQuery {
                    vector: vec![0.0; 8],
                    sparse: None,
                    text: None,
                    limit: 1000,
                    filter: storage::PayloadFilter::default(),
                },
            )
            .await
            .unwrap();
        let mut paths: Vec<String> = hits.into_iter().map(|h| h.payload.relative_path).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    #[tokio::test]
    async fn initial_sync_indexes_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(Arc::clone(&store), Arc::clone(&index));
        let target = target("c1");

        let stats = syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.chunks_added, 2);
        assert!(stats.errors.is_empty());
        assert_eq!(store.count("c1").await.unwrap(), 2);
        assert_eq!(
            index
                .get_all(target.project_id, target.dataset_id)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn second_sync_is_a_no_op() {
        let dir = tempfile::TempDir::new().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.rs")), format!("fn f{i}() {{}}"))
                .unwrap();
        }

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(Arc::clone(&store), Arc::clone(&index));
        let target = target("c1");

        syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();
        let second = syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.modified, 0);
        assert_eq!(second.deleted, 0);
        assert_eq!(second.renamed, 0);
        assert_eq!(second.unchanged, 5);
        assert_eq!(second.chunks_added, 0);
        assert_eq!(second.chunks_removed, 0);
    }

    #[tokio::test]
    async fn modification_replaces_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn old() {}").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(Arc::clone(&store), Arc::clone(&index));
        let target = target("c1");

        syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();
        std::fs::write(&file, "fn new_body() {}").unwrap();
        let stats = syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(stats.modified, 1);
        assert_eq!(stats.chunks_removed, 1);
        assert_eq!(stats.chunks_added, 1);
        assert_eq!(store.count("c1").await.unwrap(), 1);

        let metadata = index
            .get_all(target.project_id, target.dataset_id)
            .await
            .unwrap();
        assert_eq!(
            metadata[0].sha256_hash,
            crate::hash::HashCalculator::hash_string("fn new_body() {}")
        );
    }

    #[tokio::test]
    async fn deletion_removes_chunks_and_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(Arc::clone(&store), Arc::clone(&index));
        let target = target("c1");

        syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();
        std::fs::remove_file(dir.path().join("a.rs")).unwrap();
        let stats = syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.chunks_removed, 1);
        assert_eq!(all_paths(&store, "c1").await, vec!["b.rs".to_string()]);
        assert_eq!(
            index
                .get_all(target.project_id, target.dataset_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn rename_patches_payloads_without_vector_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("x")).unwrap();
        std::fs::write(dir.path().join("x/old.rs"), "fn same() {}").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(Arc::clone(&store), Arc::clone(&index));
        let target = target("c1");

        syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();
        let points_before = store.count("c1").await.unwrap();

        std::fs::rename(dir.path().join("x/old.rs"), dir.path().join("x/new.rs")).unwrap();
        let stats = syncer
            .sync(
                dir.path(),
                &target,
                SyncOptions {
                    detect_renames: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(stats.renamed, 1);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.chunks_added, 0);
        assert_eq!(stats.chunks_removed, 0);
        assert_eq!(store.count("c1").await.unwrap(), points_before);
        assert_eq!(all_paths(&store, "c1").await, vec!["x/new.rs".to_string()]);

        let metadata = index
            .get_all(target.project_id, target.dataset_id)
            .await
            .unwrap();
        assert_eq!(metadata[0].relative_path, "x/new.rs");
    }

    #[tokio::test]
    async fn force_reindex_converges_to_same_shape() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("b.rs"), "fn b() {}\nfn c() {}").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(Arc::clone(&store), Arc::clone(&index));
        let target = target("c1");

        syncer
            .sync(dir.path(), &target, SyncOptions::default())
            .await
            .unwrap();
        let before: Vec<(String, i32)> = index
            .get_all(target.project_id, target.dataset_id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| (f.relative_path, f.chunk_count))
            .collect();

        let stats = syncer
            .sync(
                dir.path(),
                &target,
                SyncOptions {
                    force: true,
                    ..SyncOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stats.created, 2);

        let after: Vec<(String, i32)> = index
            .get_all(target.project_id, target.dataset_id)
            .await
            .unwrap()
            .into_iter()
            .map(|f| (f.relative_path, f.chunk_count))
            .collect();
        assert_eq!(before, after);
        assert_eq!(store.count("c1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn progress_phases_are_reported_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        let store = Arc::new(MemoryVectorStore::new());
        let index = Arc::new(MemoryFileIndex::new());
        let syncer = syncer(store, index);
        let target = target("c1");

        let phases: Arc<std::sync::Mutex<Vec<SyncPhase>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&phases);
        let options = SyncOptions {
            progress: Some(Arc::new(move |p: SyncProgress| {
                sink.lock().unwrap().push(p.phase);
            })),
            ..SyncOptions::default()
        };

        syncer.sync(dir.path(), &target, options).await.unwrap();
        let phases = phases.lock().unwrap();
        assert_eq!(phases.first(), Some(&SyncPhase::Scanning));
        assert_eq!(phases.last(), Some(&SyncPhase::Complete));
        assert!(phases.contains(&SyncPhase::Creating));
    }
}
