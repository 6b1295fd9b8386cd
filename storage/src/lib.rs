use std::time::Duration;

use context_core::{EngineConfig, EngineError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

pub mod collections;
pub mod crawls;
pub mod files;
pub mod jobs;
pub mod scope;
pub mod shares;
pub mod stats;
pub mod vector;
pub mod watch;

pub use collections::{CollectionRead, CollectionRegistry};
pub use crawls::CrawlSessionStore;
pub use files::{FileIndex, LanguageStat, MemoryFileIndex, PgFileIndex};
pub use jobs::{backoff, EnqueueJob, JobQueue};
pub use scope::{collection_name_for, ScopeManager, ScopeRead};
pub use shares::ShareStore;
pub use stats::{ProjectStat, RecentCrawl, StatsReader, StatsSnapshot};
pub use vector::{
    HybridHits, MemoryVectorStore, PayloadFilter, PgVectorStore, RemoteVectorStore, ScoredPoint,
    VectorQuery, VectorStore,
};
pub use watch::{MemoryWatchStore, PgWatchStore, WatchConfig, WatchConfigStore};

/// Connect the shared pool and bring the schema up to date. Short
/// transactions everywhere else rely on this pool being bounded.
pub async fn connect(config: &EngineConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.postgres_url)
        .await
        .map_err(|e| EngineError::config(format!("cannot connect to PostgreSQL: {e}")))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| EngineError::config(format!("migration failed: {e}")))?;

    Ok(pool)
}

/// Map driver errors onto the engine taxonomy. Unique and check
/// violations are conflicts, a missing row is not-found, everything
/// connection-shaped is transient.
pub(crate) fn db_err(e: sqlx::Error) -> EngineError {
    match &e {
        sqlx::Error::RowNotFound => EngineError::not_found("row not found"),
        sqlx::Error::Database(db) => {
            if let Some(code) = db.code() {
                if code.starts_with("23") {
                    return EngineError::conflict(db.message().to_string());
                }
            }
            EngineError::transient(format!("database error: {}", db.message()))
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_) => {
            EngineError::transient(e.to_string())
        }
        _ => EngineError::transient(format!("database error: {e}")),
    }
}
