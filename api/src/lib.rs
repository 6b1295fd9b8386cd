use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use context_core::{EngineConfig, EngineError, Result, SourceType};
use embeddings::{Embedder, HashedSparseEncoder, LineChunker, RemoteEmbedder, SparseEncoder};
use ingestion::{
    CrawlRequest, CrawlerClient, IncrementalSyncer, IngestionWorker, SyncTarget, TargetResolver,
};
use ingestion::watcher::WatcherSettings;
use ingestion::WatchController;
use ingestion::workers::WorkerDeps;
use query::{planner::PlannerConfig, QueryPlanner};
use sqlx::PgPool;
use storage::{
    collection_name_for, CollectionRegistry, CrawlSessionStore, EnqueueJob, JobQueue, PgFileIndex,
    PgVectorStore, PgWatchStore, RemoteVectorStore, ScopeManager, ScopeRead, StatsReader,
    VectorStore,
};
use telemetry::{CrawlMonitor, MetadataMonitor, SubscriptionBus, TrackedCrawl, VectorStoreMonitor};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_DIMENSION: usize = 768;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Resolves sync targets from durable ids, registering the dataset's
/// collection on first use.
struct EngineResolver {
    scope: Arc<ScopeManager>,
    registry: Arc<CollectionRegistry>,
    dimension: usize,
    hybrid: bool,
}

#[async_trait]
impl TargetResolver for EngineResolver {
    async fn resolve(&self, project_id: Uuid, dataset_id: Uuid) -> Result<SyncTarget> {
        let dataset = self
            .scope
            .dataset_by_id(dataset_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("dataset {dataset_id}")))?;
        let project = self
            .scope
            .project_name(project_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("project {project_id}")))?;

        let collection = match self.registry.get(dataset.id).await? {
            Some(row) => row,
            None => {
                let name = collection_name_for(dataset.project_id, dataset.id, dataset.scope);
                self.registry
                    .ensure(dataset.id, &name, self.dimension as i32, self.hybrid)
                    .await?
            }
        };

        Ok(SyncTarget {
            project_id,
            dataset_id,
            project,
            dataset: dataset.name,
            collection_name: collection.collection_name,
            dimension: collection.dimension as usize,
            hybrid: collection.is_hybrid,
            source_type: SourceType::Local,
            repo: None,
            branch: None,
            sha: None,
        })
    }
}

/// The assembled engine: shared pool, stores, watchers, workers,
/// monitors and the query planner, all owned by one struct with an
/// explicit start/shutdown lifecycle. Transports embed this.
pub struct Engine {
    config: EngineConfig,
    pool: PgPool,
    scope: Arc<ScopeManager>,
    queue: Arc<JobQueue>,
    sessions: Arc<CrawlSessionStore>,
    bus: Arc<SubscriptionBus>,
    planner: Arc<QueryPlanner>,
    watch_controller: Arc<WatchController>,
    crawl_monitor: Option<Arc<CrawlMonitor>>,
    worker: Arc<IngestionWorker>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub async fn start(config: EngineConfig) -> Result<Engine> {
        let pool = storage::connect(&config).await?;
        info!("connected to PostgreSQL (pool max {})", config.pool_max);

        let scope = Arc::new(ScopeManager::new(pool.clone()));
        let registry = Arc::new(CollectionRegistry::new(pool.clone()));
        let file_index = Arc::new(PgFileIndex::new(pool.clone()));
        let queue = Arc::new(JobQueue::new(pool.clone(), config.retry_backoff_base_secs));
        let sessions = Arc::new(CrawlSessionStore::new(pool.clone()));
        let watch_store = Arc::new(PgWatchStore::new(pool.clone()));

        let vector_store: Arc<dyn VectorStore> = match &config.vector_store_url {
            Some(url) => {
                info!("using remote vector store at {}", url);
                Arc::new(RemoteVectorStore::new(url.clone())?)
            }
            None => {
                info!("using PostgreSQL-backed vector store");
                Arc::new(PgVectorStore::new(pool.clone()))
            }
        };

        let embedder: Arc<dyn Embedder> = Arc::new(RemoteEmbedder::new(
            config.embedder_url.clone(),
            config.embedder_model.clone(),
        )?);
        let dimension = match embedder.dimension().await {
            Ok(dimension) => {
                info!("embedder dimension discovered: {}", dimension);
                dimension
            }
            Err(e) => {
                warn!(
                    "embedder unreachable at startup ({}), assuming dimension {}",
                    e, DEFAULT_DIMENSION
                );
                DEFAULT_DIMENSION
            }
        };

        let chunker = Arc::new(LineChunker::new());
        let sparse: Option<Arc<dyn SparseEncoder>> = config
            .enable_hybrid_search
            .then(|| Arc::new(HashedSparseEncoder::default()) as Arc<dyn SparseEncoder>);

        let resolver = Arc::new(EngineResolver {
            scope: Arc::clone(&scope),
            registry: Arc::clone(&registry),
            dimension,
            hybrid: config.enable_hybrid_search,
        });

        let syncer = Arc::new(IncrementalSyncer::new(
            file_index,
            Arc::clone(&vector_store),
            Arc::clone(&embedder),
            chunker.clone(),
            sparse.clone(),
        ));

        let bus = Arc::new(SubscriptionBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Watcher events flow through a channel into the bus so the
        // ingestion layer stays free of telemetry types.
        let (event_tx, mut event_rx) = mpsc::channel(512);
        {
            let bus = Arc::clone(&bus);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    bus.publish(event);
                }
            }));
        }

        let watch_controller = Arc::new(WatchController::new(
            watch_store,
            resolver.clone() as Arc<dyn TargetResolver>,
            Arc::clone(&syncer),
            event_tx,
            WatcherSettings {
                default_debounce_ms: config.debounce_ms,
                write_stability_ms: config.write_stability_ms,
                health_interval: Duration::from_secs(config.watcher_health_interval_secs),
                auto_recover: config.auto_recover,
                shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
                backup_path: config.watch_backup_or_default(),
                emit_raw_events: false,
            },
        ));
        watch_controller.restore().await?;
        tasks.push(tokio::spawn(
            Arc::clone(&watch_controller).run_health_loop(shutdown_rx.clone()),
        ));

        let crawler = match &config.crawler_url {
            Some(url) => Some(Arc::new(CrawlerClient::new(url.clone())?)),
            None => None,
        };

        let worker_deps = Arc::new(WorkerDeps {
            queue: Arc::clone(&queue),
            resolver: resolver.clone() as Arc<dyn TargetResolver>,
            vector_store: Arc::clone(&vector_store),
            embedder: Arc::clone(&embedder),
            chunker,
            sparse,
            registry: Arc::clone(&registry),
            sessions: Arc::clone(&sessions),
            crawler: crawler.clone(),
        });
        let worker = Arc::new(IngestionWorker::new(
            Arc::clone(&worker_deps),
            Duration::from_secs(1),
            Duration::from_millis(config.crawl_polling_interval_ms),
            config.request_body_limit_bytes,
        ));
        for _ in 0..config.worker_count {
            let worker = Arc::new(IngestionWorker::new(
                Arc::clone(&worker_deps),
                Duration::from_secs(1),
                Duration::from_millis(config.crawl_polling_interval_ms),
                config.request_body_limit_bytes,
            ));
            tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }

        let metadata_monitor = MetadataMonitor::new(
            pool.clone(),
            StatsReader::new(pool.clone()),
            Arc::clone(&bus),
            Duration::from_secs(config.postgres_polling_interval_secs),
        );
        tasks.push(tokio::spawn(metadata_monitor.run(shutdown_rx.clone())));

        let vector_monitor = VectorStoreMonitor::new(
            Arc::clone(&vector_store),
            Arc::clone(&registry),
            Arc::clone(&bus),
            Duration::from_secs(config.vector_store_polling_interval_secs),
        );
        tasks.push(tokio::spawn(vector_monitor.run(shutdown_rx.clone())));

        let crawl_monitor = match &crawler {
            Some(client) => {
                let monitor = Arc::new(CrawlMonitor::new(
                    Arc::clone(client),
                    Arc::clone(&sessions),
                    Arc::clone(&bus),
                    Duration::from_millis(config.crawl_polling_interval_ms),
                ));
                // Re-arm sessions that were still running before a restart.
                for session in sessions.active().await? {
                    if let (Some(project), Some(dataset)) = (
                        scope.project_name(session.project_id).await?,
                        scope.dataset_by_id(session.dataset_id).await?,
                    ) {
                        monitor.track(
                            session.external_id.clone(),
                            TrackedCrawl {
                                project,
                                dataset: dataset.name,
                                dataset_id: session.dataset_id,
                            },
                        );
                    }
                }
                tasks.push(tokio::spawn(
                    Arc::clone(&monitor).run(shutdown_rx.clone()),
                ));
                Some(monitor)
            }
            None => None,
        };

        // Retention maintenance for terminal job rows.
        {
            let queue = Arc::clone(&queue);
            let retention_days = config.job_retention_days;
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            match queue.cleanup(retention_days).await {
                                Ok(0) => {}
                                Ok(n) => info!("removed {} terminal job row(s)", n),
                                Err(e) => warn!("job cleanup failed: {}", e),
                            }
                        }
                    }
                }
            }));
        }

        let planner = Arc::new(QueryPlanner::new(
            Arc::clone(&scope) as _,
            Arc::clone(&registry) as _,
            Arc::clone(&vector_store),
            Arc::clone(&embedder),
            config
                .enable_hybrid_search
                .then(|| Arc::new(HashedSparseEncoder::default()) as Arc<dyn SparseEncoder>),
            None,
            PlannerConfig {
                enable_hybrid: config.enable_hybrid_search,
                oversample_factor: config.oversample_factor,
                timeout: Duration::from_millis(config.query_timeout_ms),
            },
        ));

        Ok(Engine {
            config,
            pool,
            scope,
            queue,
            sessions,
            bus,
            planner,
            watch_controller,
            crawl_monitor,
            worker,
            shutdown_tx,
            tasks,
        })
    }

    pub fn planner(&self) -> Arc<QueryPlanner> {
        Arc::clone(&self.planner)
    }

    pub fn bus(&self) -> Arc<SubscriptionBus> {
        Arc::clone(&self.bus)
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        Arc::clone(&self.queue)
    }

    pub fn scope(&self) -> Arc<ScopeManager> {
        Arc::clone(&self.scope)
    }

    pub fn watch_controller(&self) -> Arc<WatchController> {
        Arc::clone(&self.watch_controller)
    }

    pub fn sessions(&self) -> Arc<CrawlSessionStore> {
        Arc::clone(&self.sessions)
    }

    /// Queue a repository for ingestion, creating project and dataset
    /// on first reference.
    pub async fn enqueue_repo(
        &self,
        project: &str,
        dataset: &str,
        repo_url: &str,
        branch: &str,
        sha: Option<String>,
        priority: i32,
    ) -> Result<context_core::RepoJob> {
        let project = self.scope.resolve_project(project).await?;
        let dataset = self.scope.resolve_dataset(project.id, dataset, None).await?;
        self.queue
            .enqueue(EnqueueJob {
                project_id: project.id,
                dataset_id: dataset.id,
                repo_url: repo_url.to_string(),
                branch: branch.to_string(),
                sha,
                priority,
                max_retries: self.config.default_max_retries,
            })
            .await
    }

    /// Start a crawl and follow it to completion. The crawl monitor
    /// tracks the session for progress telemetry while the worker
    /// streams pages into the vector pipeline.
    pub async fn start_crawl(
        &self,
        project: &str,
        dataset: &str,
        start_url: &str,
        max_pages: u32,
        depth: u32,
    ) -> Result<String> {
        let project = self.scope.resolve_project(project).await?;
        let dataset_row = self.scope.resolve_dataset(project.id, dataset, None).await?;

        let request = CrawlRequest {
            start_url: start_url.to_string(),
            project: project.name.clone(),
            dataset: dataset_row.name.clone(),
            crawl_type: "site".to_string(),
            max_pages,
            depth,
            scope: "domain".to_string(),
        };

        let session_id = self
            .worker
            .run_crawl(project.id, dataset_row.id, request)
            .await?;
        if let Some(monitor) = &self.crawl_monitor {
            monitor.track(
                session_id.clone(),
                TrackedCrawl {
                    project: project.name,
                    dataset: dataset_row.name,
                    dataset_id: dataset_row.id,
                },
            );
        }
        Ok(session_id)
    }

    /// Signal every loop, give in-flight work the configured grace, and
    /// release the pool.
    pub async fn shutdown(self) {
        info!("engine shutting down");
        let _ = self.shutdown_tx.send(true);
        self.watch_controller.shutdown().await;

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        for task in self.tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("background task did not stop within grace period");
            }
        }
        self.pool.close().await;
        info!("engine stopped");
    }
}
