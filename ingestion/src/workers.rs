use std::sync::Arc;
use std::time::Duration;

use context_core::{
    ChunkPayload, EngineError, JobPhase, RepoJob, Result, SourceType, VectorDocument,
};
use embeddings::{Chunker, Embedder, SparseEncoder};
use serde_json::json;
use storage::{
    CollectionRegistry, CrawlSessionStore, JobQueue, MemoryFileIndex, VectorStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::crawler::{CrawlRequest, CrawlerClient};
use crate::git::RepoFetcher;
use crate::hash::HashCalculator;
use crate::sync::{IncrementalSyncer, SyncOptions, SyncPhase, SyncProgress, TargetResolver};

/// Shared collaborators of every worker loop.
pub struct WorkerDeps {
    pub queue: Arc<JobQueue>,
    pub resolver: Arc<dyn TargetResolver>,
    pub vector_store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub chunker: Arc<dyn Chunker>,
    pub sparse: Option<Arc<dyn SparseEncoder>>,
    pub registry: Arc<CollectionRegistry>,
    pub sessions: Arc<CrawlSessionStore>,
    pub crawler: Option<Arc<CrawlerClient>>,
}

/// Consumes jobs from the queue: shallow-clone, full sync against an
/// empty metadata set, progress per phase, retry-vs-fail per the queue
/// policy. Several workers may run per process; the queue's skip-locked
/// dispatch keeps them from colliding.
pub struct IngestionWorker {
    deps: Arc<WorkerDeps>,
    poll_interval: Duration,
    crawl_poll_interval: Duration,
    page_content_limit: usize,
}

impl IngestionWorker {
    pub fn new(
        deps: Arc<WorkerDeps>,
        poll_interval: Duration,
        crawl_poll_interval: Duration,
        page_content_limit: usize,
    ) -> Self {
        Self {
            deps,
            poll_interval,
            crawl_poll_interval,
            page_content_limit,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("ingestion worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            loop {
                match self.deps.queue.dispatch().await {
                    Ok(Some(job)) => self.process_job(job).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("job dispatch failed: {}", e);
                        break;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        info!("ingestion worker stopped");
    }

    async fn process_job(&self, job: RepoJob) {
        info!(
            job = %job.id,
            repo = %job.repo_url,
            branch = %job.branch,
            "processing repository job"
        );
        match self.run_repo_job(&job).await {
            Ok((files, chunks)) => {
                if let Err(e) = self.deps.queue.complete(job.id, files, chunks).await {
                    warn!(job = %job.id, "cannot mark job completed: {}", e);
                } else {
                    info!(job = %job.id, files, chunks, "job completed");
                }
            }
            Err(EngineError::Conflict(msg)) if msg.contains("cancelled") => {
                info!(job = %job.id, "job cancelled: {}", msg);
            }
            Err(e) => {
                error!(job = %job.id, "job failed: {}", e);
                match self.deps.queue.fail(job.id, &e.to_string()).await {
                    Ok(updated) if updated.status == context_core::JobStatus::Pending => {
                        info!(
                            job = %job.id,
                            retry = updated.retry_count,
                            visible_at = %updated.visible_at,
                            "job requeued for retry"
                        );
                    }
                    Ok(_) => warn!(job = %job.id, "job terminally failed"),
                    Err(e) => warn!(job = %job.id, "cannot record failure: {}", e),
                }
            }
        }
    }

    async fn run_repo_job(&self, job: &RepoJob) -> Result<(i32, i32)> {
        self.check_cancelled(job.id, JobPhase::Clone).await?;
        self.deps
            .queue
            .update_progress(job.id, 5, JobPhase::Clone.as_str(), None)
            .await?;

        // Per-job temp dir, removed on drop even when the job fails.
        let workdir = tempfile::TempDir::new()
            .map_err(|e| EngineError::transient(format!("cannot create temp dir: {e}")))?;
        RepoFetcher::clone_shallow(&job.repo_url, &job.branch, job.sha.as_deref(), workdir.path())
            .await?;

        self.check_cancelled(job.id, JobPhase::Scan).await?;
        self.deps
            .queue
            .update_progress(job.id, 15, JobPhase::Scan.as_str(), None)
            .await?;

        let mut target = self
            .deps
            .resolver
            .resolve(job.project_id, job.dataset_id)
            .await?;
        target.source_type = SourceType::Git;
        target.repo = Some(format!("{}/{}", job.repo_org, job.repo_name));
        target.branch = Some(job.branch.clone());
        target.sha = job.sha.clone();

        // A fresh clone syncs against an empty metadata set, so every
        // file is treated as created.
        let syncer = IncrementalSyncer::new(
            Arc::new(MemoryFileIndex::new()),
            Arc::clone(&self.deps.vector_store),
            Arc::clone(&self.deps.embedder),
            Arc::clone(&self.deps.chunker),
            self.deps.sparse.clone(),
        );

        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let queue = Arc::clone(&self.deps.queue);
        let job_id = job.id;
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let (percent, phase, file) = map_sync_progress(&progress);
                if let Err(e) = queue
                    .update_progress(job_id, percent, phase.as_str(), file.as_deref())
                    .await
                {
                    warn!(job = %job_id, "progress update failed: {}", e);
                }
            }
        });

        let options = SyncOptions {
            force: false,
            detect_renames: false,
            progress: Some(Arc::new(move |p: SyncProgress| {
                let _ = progress_tx.send(p);
            })),
        };
        let stats = syncer.sync(workdir.path(), &target, options).await;
        forwarder.abort();
        let stats = stats?;

        self.check_cancelled(job.id, JobPhase::Finalize).await?;
        self.deps
            .queue
            .update_progress(job.id, 95, JobPhase::Finalize.as_str(), None)
            .await?;

        let point_count = self.deps.vector_store.count(&target.collection_name).await?;
        self.deps
            .registry
            .record_indexed(target.dataset_id, point_count as i64)
            .await?;

        Ok((stats.created as i32, stats.chunks_added as i32))
    }

    async fn check_cancelled(&self, job_id: Uuid, phase: JobPhase) -> Result<()> {
        if self.deps.queue.is_cancelled(job_id).await? {
            return Err(EngineError::conflict(format!(
                "cancelled at phase {}",
                phase.as_str()
            )));
        }
        Ok(())
    }

    /// Drive one crawl end to end: start it, poll progress at a bounded
    /// rate, stream crawled pages through chunk → embed → upsert, and
    /// keep the session row in step.
    pub async fn run_crawl(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
        request: CrawlRequest,
    ) -> Result<String> {
        let crawler = self
            .deps
            .crawler
            .as_ref()
            .ok_or_else(|| EngineError::config("no crawler_url configured"))?;

        let mut target = self.deps.resolver.resolve(project_id, dataset_id).await?;
        target.source_type = SourceType::Web;

        if !self
            .deps
            .vector_store
            .has_collection(&target.collection_name)
            .await?
        {
            self.deps
                .vector_store
                .create_collection(&target.collection_name, target.dimension, target.hybrid)
                .await?;
        }

        let started = crawler.start_crawl(&request).await?;
        let session = self
            .deps
            .sessions
            .open(
                project_id,
                dataset_id,
                &started.session_id,
                json!({"startUrl": request.start_url, "phase": "starting"}),
            )
            .await?;
        info!(session = %started.session_id, "crawl started");

        let mut offset = 0u32;
        let mut total_chunks = 0usize;
        loop {
            tokio::time::sleep(self.crawl_poll_interval).await;
            let progress = crawler.progress(&started.session_id).await?;

            let batch = crawler.pages(&started.session_id, offset).await?;
            for page in &batch.pages {
                offset += 1;
                match self.index_page(&target, session.id, page).await {
                    Ok(chunks) => total_chunks += chunks,
                    Err(e) => warn!(url = %page.url, "page skipped: {}", e),
                }
            }

            // A failed crawl counts its unfetched remainder as failed pages.
            let pages_failed = if progress.status == "failed" {
                progress.total.saturating_sub(progress.current) as i32
            } else {
                0
            };
            self.deps
                .sessions
                .sync_progress(
                    dataset_id,
                    &started.session_id,
                    &progress.status,
                    progress.current as i32,
                    pages_failed,
                    json!({
                        "phase": progress.phase,
                        "progress": progress.percentage,
                        "phase_detail": progress.phase_detail,
                    }),
                )
                .await?;

            if progress.is_terminal() {
                if progress.status == "failed" {
                    return Err(EngineError::upstream(
                        "crawler",
                        format!("crawl {} failed", started.session_id),
                    ));
                }
                break;
            }
        }

        let point_count = self.deps.vector_store.count(&target.collection_name).await?;
        self.deps
            .registry
            .record_indexed(dataset_id, point_count as i64)
            .await?;
        info!(
            session = %started.session_id,
            chunks = total_chunks,
            "crawl ingestion finished"
        );
        Ok(started.session_id)
    }

    async fn index_page(
        &self,
        target: &crate::sync::SyncTarget,
        session_id: Uuid,
        page: &crate::crawler::CrawledPage,
    ) -> Result<usize> {
        let mut content = page.content.as_str();
        if content.len() > self.page_content_limit {
            // Keep a char boundary; oversized pages are truncated, not dropped.
            let mut cut = self.page_content_limit;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content = &content[..cut];
        }

        // Old chunks for a re-crawled page leave before new ones arrive.
        let filter = storage::PayloadFilter::for_dataset(target.project_id, target.dataset_id)
            .with_path(&page.url);
        self.deps
            .vector_store
            .delete_by_filter(&target.collection_name, &filter)
            .await?;

        let chunks = self.deps.chunker.chunk(&page.url, content);
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.deps.embedder.embed_batch(&texts).await?;
        let documents: Vec<VectorDocument> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorDocument {
                id: Uuid::new_v4(),
                vector,
                summary_vector: None,
                sparse: self
                    .deps
                    .sparse
                    .as_ref()
                    .filter(|_| target.hybrid)
                    .map(|encoder| encoder.encode(&chunk.content)),
                payload: ChunkPayload {
                    content: chunk.content.clone(),
                    relative_path: page.url.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    file_extension: None,
                    project_id: target.project_id,
                    dataset_id: target.dataset_id,
                    source_type: SourceType::Web,
                    repo: None,
                    branch: None,
                    sha: None,
                    lang: None,
                    symbol: None,
                    metadata: json!({"title": page.title}),
                },
            })
            .collect();

        let count = documents.len();
        self.deps
            .vector_store
            .upsert(&target.collection_name, documents)
            .await?;
        self.deps
            .sessions
            .record_page(
                target.project_id,
                target.dataset_id,
                session_id,
                &page.url,
                page.title.as_deref(),
                &HashCalculator::hash_string(content),
                count as i32,
            )
            .await?;
        Ok(count)
    }
}

/// Map sync-engine phases onto the coarser job phases and the 15–95%
/// progress band between clone and finalize.
fn map_sync_progress(progress: &SyncProgress) -> (i32, JobPhase, Option<String>) {
    let phase = match progress.phase {
        SyncPhase::Scanning => JobPhase::Scan,
        SyncPhase::Deleting | SyncPhase::Renaming => JobPhase::Upsert,
        SyncPhase::Updating | SyncPhase::Creating => JobPhase::Embed,
        SyncPhase::Complete => JobPhase::Finalize,
    };
    let percent = match progress.phase {
        SyncPhase::Scanning => 15,
        SyncPhase::Complete => 95,
        _ => 15 + ((progress.percentage as i32 * 80) / 100).clamp(0, 80),
    };
    (percent, phase, progress.file.clone())
}
