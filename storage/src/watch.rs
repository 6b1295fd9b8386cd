use async_trait::async_trait;
use chrono::{DateTime, Utc};
use context_core::Result;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// One persistent watcher registration. Stored in `watch_configs` and
/// mirrored into a sidecar JSON file so registrations survive database
/// resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub path: String,
    pub enabled: bool,
    pub auto_start: bool,
    pub debounce_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait WatchConfigStore: Send + Sync {
    async fn upsert(&self, config: &WatchConfig) -> Result<WatchConfig>;
    async fn remove(&self, id: Uuid) -> Result<()>;
    async fn list(&self) -> Result<Vec<WatchConfig>>;
}

pub struct PgWatchStore {
    pool: PgPool,
}

impl PgWatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WatchConfigStore for PgWatchStore {
    async fn upsert(&self, config: &WatchConfig) -> Result<WatchConfig> {
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.watch_configs
                (id, project_id, dataset_id, path, enabled, auto_start, debounce_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (project_id, dataset_id, path) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                auto_start = EXCLUDED.auto_start,
                debounce_ms = EXCLUDED.debounce_ms,
                updated_at = now()
            RETURNING id, project_id, dataset_id, path, enabled, auto_start,
                      debounce_ms, created_at, updated_at
            "#,
        )
        .bind(config.id)
        .bind(config.project_id)
        .bind(config.dataset_id)
        .bind(&config.path)
        .bind(config.enabled)
        .bind(config.auto_start)
        .bind(config.debounce_ms as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_config(&row)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM claude_context.watch_configs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WatchConfig>> {
        let rows = sqlx::query(
            "SELECT id, project_id, dataset_id, path, enabled, auto_start,
                    debounce_ms, created_at, updated_at
             FROM claude_context.watch_configs ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_config).collect()
    }
}

fn row_to_config(row: &PgRow) -> Result<WatchConfig> {
    Ok(WatchConfig {
        id: row.try_get("id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        dataset_id: row.try_get("dataset_id").map_err(db_err)?,
        path: row.try_get("path").map_err(db_err)?,
        enabled: row.try_get("enabled").map_err(db_err)?,
        auto_start: row.try_get("auto_start").map_err(db_err)?,
        debounce_ms: row.try_get::<i64, _>("debounce_ms").map_err(db_err)? as u64,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

/// In-memory twin used by the watch controller's tests.
#[derive(Default)]
pub struct MemoryWatchStore {
    rows: std::sync::Mutex<Vec<WatchConfig>>,
}

impl MemoryWatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatchConfigStore for MemoryWatchStore {
    async fn upsert(&self, config: &WatchConfig) -> Result<WatchConfig> {
        let mut rows = self.rows.lock().unwrap();
        rows.retain(|c| {
            !(c.project_id == config.project_id
                && c.dataset_id == config.dataset_id
                && c.path == config.path)
        });
        rows.push(config.clone());
        Ok(config.clone())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.rows.lock().unwrap().retain(|c| c.id != id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WatchConfig>> {
        Ok(self.rows.lock().unwrap().clone())
    }
}
