use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use context_core::{EngineEvent, Result, Topic};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use storage::{WatchConfig, WatchConfigStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::matcher::IgnoreMatcher;
use crate::sync::{IncrementalSyncer, SyncOptions, TargetResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    Degraded,
}

impl WatcherState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatcherState::Stopped => "stopped",
            WatcherState::Starting => "starting",
            WatcherState::Running => "running",
            WatcherState::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub default_debounce_ms: u64,
    pub write_stability_ms: u64,
    pub health_interval: Duration,
    pub auto_recover: bool,
    pub shutdown_grace: Duration,
    pub backup_path: PathBuf,
    pub emit_raw_events: bool,
}

struct WatcherHandle {
    config: WatchConfig,
    state: Arc<Mutex<WatcherState>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns one debounced watcher task per registered `(project, dataset,
/// path)`. Registrations persist to the database and a sidecar JSON
/// backup; a periodic health loop restarts anything not running.
pub struct WatchController {
    store: Arc<dyn WatchConfigStore>,
    resolver: Arc<dyn TargetResolver>,
    syncer: Arc<IncrementalSyncer>,
    events: mpsc::Sender<EngineEvent>,
    settings: WatcherSettings,
    watchers: Mutex<HashMap<Uuid, WatcherHandle>>,
}

impl WatchController {
    pub fn new(
        store: Arc<dyn WatchConfigStore>,
        resolver: Arc<dyn TargetResolver>,
        syncer: Arc<IncrementalSyncer>,
        events: mpsc::Sender<EngineEvent>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            resolver,
            syncer,
            events,
            settings,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a watcher, persist it, and start it when enabled.
    pub async fn add(&self, mut config: WatchConfig) -> Result<WatchConfig> {
        if config.debounce_ms == 0 {
            config.debounce_ms = self.settings.default_debounce_ms;
        }
        let config = self.store.upsert(&config).await?;
        self.write_backup().await;
        if config.enabled {
            self.start(config.clone());
        }
        Ok(config)
    }

    pub async fn remove(&self, id: Uuid) -> Result<()> {
        self.stop_watcher(id).await;
        self.store.remove(id).await?;
        self.write_backup().await;
        Ok(())
    }

    /// Bring back persisted watchers at boot. Falls back to the sidecar
    /// backup when the database is unavailable.
    pub async fn restore(&self) -> Result<usize> {
        let configs = match self.store.list().await {
            Ok(configs) => configs,
            Err(e) => {
                warn!("watch store unavailable ({}), restoring from backup", e);
                self.read_backup().await
            }
        };
        let mut started = 0;
        for config in configs {
            if config.enabled && config.auto_start {
                self.start(config);
                started += 1;
            }
        }
        info!("restored {} watcher(s)", started);
        Ok(started)
    }

    pub fn states(&self) -> Vec<(Uuid, String, WatcherState)> {
        self.watchers
            .lock()
            .unwrap()
            .values()
            .map(|h| (h.config.id, h.config.path.clone(), *h.state.lock().unwrap()))
            .collect()
    }

    fn start(&self, config: WatchConfig) {
        let state = Arc::new(Mutex::new(WatcherState::Starting));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(watch_loop(
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&self.resolver),
            Arc::clone(&self.syncer),
            self.events.clone(),
            self.settings.clone(),
            stop_rx,
        ));

        let handle = WatcherHandle {
            config,
            state,
            stop: stop_tx,
            task,
        };
        let mut watchers = self.watchers.lock().unwrap();
        if let Some(old) = watchers.insert(handle.config.id, handle) {
            old.task.abort();
        }
    }

    async fn stop_watcher(&self, id: Uuid) {
        let handle = self.watchers.lock().unwrap().remove(&id);
        if let Some(handle) = handle {
            let _ = handle.stop.send(true);
            if tokio::time::timeout(self.settings.shutdown_grace, handle.task)
                .await
                .is_err()
            {
                warn!("watcher {} did not stop within grace period", id);
            }
        }
    }

    /// Health pass: restart every enabled watcher that is not running.
    pub async fn check_health(&self) {
        if !self.settings.auto_recover {
            return;
        }
        let stale: Vec<WatchConfig> = self
            .watchers
            .lock()
            .unwrap()
            .values()
            .filter(|h| {
                h.config.enabled && *h.state.lock().unwrap() != WatcherState::Running
            })
            .map(|h| h.config.clone())
            .collect();
        for config in stale {
            warn!("watcher {} not running, restarting", config.id);
            self.stop_watcher(config.id).await;
            self.start(config);
        }
    }

    pub async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_health().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Stop every watcher; in-flight syncs get the configured grace.
    pub async fn shutdown(&self) {
        let handles: Vec<WatcherHandle> = {
            let mut watchers = self.watchers.lock().unwrap();
            watchers.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            let _ = handle.stop.send(true);
        }
        for handle in handles {
            if tokio::time::timeout(self.settings.shutdown_grace, handle.task)
                .await
                .is_err()
            {
                warn!("abandoning watcher after grace period");
            }
        }
    }

    async fn write_backup(&self) {
        let configs = match self.store.list().await {
            Ok(configs) => configs,
            Err(_) => return,
        };
        let path = self.settings.backup_path.clone();
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        match serde_json::to_vec_pretty(&configs) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!("cannot write watcher backup {:?}: {}", path, e);
                }
            }
            Err(e) => warn!("cannot serialize watcher backup: {}", e),
        }
    }

    async fn read_backup(&self) -> Vec<WatchConfig> {
        match tokio::fs::read(&self.settings.backup_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    config: WatchConfig,
    state: Arc<Mutex<WatcherState>>,
    resolver: Arc<dyn TargetResolver>,
    syncer: Arc<IncrementalSyncer>,
    events: mpsc::Sender<EngineEvent>,
    settings: WatcherSettings,
    mut stop: watch::Receiver<bool>,
) {
    let root = PathBuf::from(&config.path);
    let target = match resolver.resolve(config.project_id, config.dataset_id).await {
        Ok(target) => target,
        Err(e) => {
            *state.lock().unwrap() = WatcherState::Degraded;
            emit_error(&events, &config, &format!("cannot resolve sync target: {e}")).await;
            return;
        }
    };
    let matcher = match IgnoreMatcher::new(&root) {
        Ok(matcher) => matcher,
        Err(e) => {
            *state.lock().unwrap() = WatcherState::Degraded;
            emit_error(&events, &config, &format!("cannot build ignore rules: {e}")).await;
            return;
        }
    };

    let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<notify::Event>>(1024);
    let mut watcher = match RecommendedWatcher::new(
        move |res| {
            // Dropped events are fine: the next sync covers the whole path.
            let _ = raw_tx.blocking_send(res);
        },
        NotifyConfig::default(),
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            *state.lock().unwrap() = WatcherState::Degraded;
            emit_error(&events, &config, &format!("cannot create watcher: {e}")).await;
            return;
        }
    };
    if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
        *state.lock().unwrap() = WatcherState::Degraded;
        emit_error(&events, &config, &format!("cannot watch {root:?}: {e}")).await;
        return;
    }

    info!("watching {:?} (debounce {}ms)", root, config.debounce_ms);
    *state.lock().unwrap() = WatcherState::Running;

    let debounce = Duration::from_millis(config.debounce_ms.max(1));
    let stability = Duration::from_millis(settings.write_stability_ms);

    // Two separate timers. A write first lands in `hot` and graduates to
    // `pending` once that path has been quiet for the stability window;
    // the per-watcher debounce timer restarts on every event and flushes
    // the pending set into one sync when it fires.
    let mut hot: HashMap<PathBuf, Instant> = HashMap::new();
    let mut pending: HashSet<PathBuf> = HashSet::new();
    let mut last_event = Instant::now();

    loop {
        let stability_deadline = hot.values().min().map(|t| *t + stability);
        let debounce_deadline = (!pending.is_empty()).then(|| last_event + debounce);

        tokio::select! {
            _ = stop.changed() => break,
            maybe_event = raw_rx.recv() => {
                match maybe_event {
                    Some(Ok(event)) => {
                        let relevant: Vec<PathBuf> = event
                            .paths
                            .iter()
                            .filter(|p| matcher.is_admitted(p))
                            .cloned()
                            .collect();
                        if relevant.is_empty() {
                            continue;
                        }
                        last_event = Instant::now();
                        if settings.emit_raw_events {
                            let _ = events.try_send(EngineEvent::for_project(
                                Topic::WatchEvent,
                                target.project.clone(),
                                json!({
                                    "path": config.path,
                                    "kind": format!("{:?}", event.kind),
                                    "files": relevant.len(),
                                }),
                            ));
                        }
                        for path in relevant {
                            // A fresh write invalidates an earlier graduation.
                            pending.remove(&path);
                            hot.insert(path, last_event);
                        }
                    }
                    Some(Err(e)) => {
                        *state.lock().unwrap() = WatcherState::Degraded;
                        emit_error(&events, &config, &format!("watch backend error: {e}")).await;
                        break;
                    }
                    None => {
                        *state.lock().unwrap() = WatcherState::Degraded;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(or_far(stability_deadline)),
                    if stability_deadline.is_some() => {
                for path in stable_paths(&hot, Instant::now(), stability) {
                    hot.remove(&path);
                    pending.insert(path);
                }
            }
            _ = tokio::time::sleep_until(or_far(debounce_deadline)),
                    if debounce_deadline.is_some() => {
                pending.clear();
                run_sync(&config, &target, &syncer, &events, &root).await;
            }
        }
    }

    *state.lock().unwrap() = WatcherState::Stopped;
}

/// Paths whose last write is at least `stability` old.
fn stable_paths(
    hot: &HashMap<PathBuf, Instant>,
    now: Instant,
    stability: Duration,
) -> Vec<PathBuf> {
    hot.iter()
        .filter(|(_, last)| now.duration_since(**last) >= stability)
        .map(|(path, _)| path.clone())
        .collect()
}

/// Disabled select branches still evaluate their expression, so a
/// missing deadline maps onto one far enough out to never fire.
fn or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

/// One sync per watcher at a time: the loop runs it inline, so events
/// arriving meanwhile queue up for the next debounce cycle.
async fn run_sync(
    config: &WatchConfig,
    target: &crate::sync::SyncTarget,
    syncer: &IncrementalSyncer,
    events: &mpsc::Sender<EngineEvent>,
    root: &Path,
) {
    let options = SyncOptions {
        detect_renames: true,
        ..SyncOptions::default()
    };
    match syncer.sync(root, target, options).await {
        Ok(stats) => {
            let _ = events
                .send(EngineEvent::for_project(
                    Topic::WatchSync,
                    target.project.clone(),
                    json!({
                        "projectId": config.project_id,
                        "datasetId": config.dataset_id,
                        "path": config.path,
                        "created": stats.created,
                        "modified": stats.modified,
                        "deleted": stats.deleted,
                        "renamed": stats.renamed,
                        "unchanged": stats.unchanged,
                        "chunksAdded": stats.chunks_added,
                        "chunksRemoved": stats.chunks_removed,
                        "errors": stats.errors.len(),
                        "durationMs": stats.duration.as_millis() as u64,
                    }),
                ))
                .await;
        }
        Err(e) => {
            error!("watch sync failed for {:?}: {}", root, e);
            emit_error(events, config, &e.to_string()).await;
        }
    }
}

async fn emit_error(events: &mpsc::Sender<EngineEvent>, config: &WatchConfig, message: &str) {
    let _ = events
        .send(EngineEvent::new(
            Topic::WatchError,
            json!({
                "projectId": config.project_id,
                "datasetId": config.dataset_id,
                "path": config.path,
                "message": message,
            }),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncTarget;
    use async_trait::async_trait;
    use chrono::Utc;
    use context_core::SourceType;
    use embeddings::{LineChunker, MockEmbedder};
    use storage::{MemoryFileIndex, MemoryVectorStore, MemoryWatchStore};
    use tempfile::TempDir;

    struct FixedResolver {
        target: SyncTarget,
    }

    #[async_trait]
    impl TargetResolver for FixedResolver {
        async fn resolve(&self, _project: Uuid, _dataset: Uuid) -> Result<SyncTarget> {
            Ok(self.target.clone())
        }
    }

    fn settings(backup: PathBuf) -> WatcherSettings {
        WatcherSettings {
            default_debounce_ms: 100,
            write_stability_ms: 50,
            health_interval: Duration::from_secs(30),
            auto_recover: true,
            shutdown_grace: Duration::from_secs(5),
            backup_path: backup,
            emit_raw_events: false,
        }
    }

    fn controller(
        dir: &TempDir,
        target: SyncTarget,
    ) -> (Arc<WatchController>, mpsc::Receiver<EngineEvent>) {
        controller_with(target, settings(dir.path().join("backup/watchers.json")))
    }

    fn controller_with(
        target: SyncTarget,
        settings: WatcherSettings,
    ) -> (Arc<WatchController>, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let syncer = Arc::new(IncrementalSyncer::new(
            Arc::new(MemoryFileIndex::new()),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MockEmbedder::new(8)),
            Arc::new(LineChunker::new()),
            None,
        ));
        let controller = WatchController::new(
            Arc::new(MemoryWatchStore::new()),
            Arc::new(FixedResolver { target }),
            syncer,
            tx,
            settings,
        );
        (Arc::new(controller), rx)
    }

    fn config(root: &Path) -> WatchConfig {
        WatchConfig {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
            path: root.to_string_lossy().to_string(),
            enabled: true,
            auto_start: true,
            debounce_ms: 100,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn target() -> SyncTarget {
        SyncTarget {
            project_id: Uuid::new_v4(),
            dataset_id: Uuid::new_v4(),
            project: "alpha".to_string(),
            dataset: "code".to_string(),
            collection_name: "watcher_test".to_string(),
            dimension: 8,
            hybrid: false,
            source_type: SourceType::Local,
            repo: None,
            branch: None,
            sha: None,
        }
    }

    #[tokio::test]
    async fn debounced_change_triggers_one_sync() {
        let work = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();

        let (controller, mut rx) = controller(&work, target());
        controller.add(config(watched.path())).await.unwrap();

        // Give the watcher a moment to come up before mutating the tree.
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(watched.path().join("a.rs"), "fn a() {}").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(event) if event.topic == Topic::WatchSync => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no watch:sync event arrived");

        assert_eq!(event.data["created"], 1);
        assert_eq!(event.project.as_deref(), Some("alpha"));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn debounce_below_stability_still_syncs() {
        let work = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();

        // Per-watcher debounce shorter than the global stability window:
        // the flush waits for the file to stabilise, not forever.
        let mut settings = settings(work.path().join("backup/watchers.json"));
        settings.write_stability_ms = 300;
        let (controller, mut rx) = controller_with(target(), settings);
        let mut config = config(watched.path());
        config.debounce_ms = 50;
        controller.add(config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(watched.path().join("a.rs"), "fn a() {}").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Some(event) if event.topic == Topic::WatchSync => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("no watch:sync event arrived");
        assert_eq!(event.data["created"], 1);
        controller.shutdown().await;
    }

    #[test]
    fn stable_paths_filters_by_age() {
        let now = Instant::now();
        let stability = Duration::from_millis(500);
        let mut hot = HashMap::new();
        hot.insert(PathBuf::from("old.rs"), now - Duration::from_millis(800));
        hot.insert(PathBuf::from("fresh.rs"), now - Duration::from_millis(100));

        let stable = stable_paths(&hot, now, stability);
        assert_eq!(stable, vec![PathBuf::from("old.rs")]);

        let all = stable_paths(&hot, now + Duration::from_secs(1), stability);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn add_persists_and_writes_backup() {
        let work = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let (controller, _rx) = controller(&work, target());

        let added = controller.add(config(watched.path())).await.unwrap();
        assert!(added.enabled);

        let backup = work.path().join("backup/watchers.json");
        assert!(backup.exists());
        let restored: Vec<WatchConfig> =
            serde_json::from_slice(&std::fs::read(&backup).unwrap()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].path, added.path);

        controller.remove(added.id).await.unwrap();
        let restored: Vec<WatchConfig> =
            serde_json::from_slice(&std::fs::read(&backup).unwrap()).unwrap();
        assert!(restored.is_empty());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn watcher_reports_running_state() {
        let work = TempDir::new().unwrap();
        let watched = TempDir::new().unwrap();
        let (controller, _rx) = controller(&work, target());
        controller.add(config(watched.path())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let states = controller.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].2, WatcherState::Running);

        controller.shutdown().await;
        assert!(controller.states().is_empty());
    }
}
