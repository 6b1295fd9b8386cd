pub mod changes;
pub mod crawler;
pub mod git;
pub mod hash;
pub mod matcher;
pub mod sync;
pub mod watcher;
pub mod workers;

pub use changes::{ChangeDetector, ChangeSummary, FileChange, RenamedFile};
pub use crawler::{CrawlProgress, CrawlRequest, CrawlStarted, CrawlerClient};
pub use git::RepoFetcher;
pub use hash::HashCalculator;
pub use matcher::IgnoreMatcher;
pub use sync::{
    IncrementalSyncer, SyncOptions, SyncPhase, SyncProgress, SyncStats, SyncTarget, TargetResolver,
};
pub use watcher::WatchController;
pub use workers::IngestionWorker;
