use context_core::{CrawlSession, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// Crawl runs tracked against the external crawler, keyed by
/// `(dataset_id, external_id)`. Metadata is patched incrementally via a
/// JSONB merge so concurrent tickers never clobber unrelated keys.
pub struct CrawlSessionStore {
    pool: PgPool,
}

impl CrawlSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open (or re-open) a session for a crawl the external service just
    /// started.
    pub async fn open(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
        external_id: &str,
        metadata: serde_json::Value,
    ) -> Result<CrawlSession> {
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.crawl_sessions
                (project_id, dataset_id, external_id, metadata)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_id, external_id) DO UPDATE
                SET status = 'running', completed_at = NULL,
                    metadata = claude_context.crawl_sessions.metadata || EXCLUDED.metadata
            RETURNING *
            "#,
        )
        .bind(project_id)
        .bind(dataset_id)
        .bind(external_id)
        .bind(metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_session(&row)
    }

    /// Progress tick: status, page counters, and a metadata patch.
    /// Terminal statuses also stamp `completed_at`.
    pub async fn sync_progress(
        &self,
        dataset_id: Uuid,
        external_id: &str,
        status: &str,
        pages_crawled: i32,
        pages_failed: i32,
        metadata_patch: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE claude_context.crawl_sessions
            SET status = $3,
                pages_crawled = $4,
                pages_failed = $5,
                metadata = metadata || $6,
                completed_at = CASE WHEN $3 IN ('completed', 'failed', 'cancelled')
                                    THEN now() ELSE completed_at END
            WHERE dataset_id = $1 AND external_id = $2
            "#,
        )
        .bind(dataset_id)
        .bind(external_id)
        .bind(status)
        .bind(pages_crawled)
        .bind(pages_failed)
        .bind(metadata_patch)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, dataset_id: Uuid, external_id: &str) -> Result<Option<CrawlSession>> {
        let row = sqlx::query(
            "SELECT * FROM claude_context.crawl_sessions
             WHERE dataset_id = $1 AND external_id = $2",
        )
        .bind(dataset_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_session(&r)).transpose()
    }

    /// Sessions still running, used to re-arm the crawl monitor after a
    /// restart.
    pub async fn active(&self) -> Result<Vec<CrawlSession>> {
        let rows = sqlx::query(
            "SELECT * FROM claude_context.crawl_sessions
             WHERE status NOT IN ('completed', 'failed', 'cancelled')
             ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_session).collect()
    }

    /// Record a crawled page and its chunk count against the session's
    /// dataset.
    pub async fn record_page(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
        session_id: Uuid,
        url: &str,
        title: Option<&str>,
        content_hash: &str,
        chunk_count: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO claude_context.web_pages
                (project_id, dataset_id, session_id, url, title, content_hash, chunk_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (dataset_id, url) DO UPDATE SET
                session_id = EXCLUDED.session_id,
                title = EXCLUDED.title,
                content_hash = EXCLUDED.content_hash,
                chunk_count = EXCLUDED.chunk_count,
                crawled_at = now()
            "#,
        )
        .bind(project_id)
        .bind(dataset_id)
        .bind(session_id)
        .bind(url)
        .bind(title)
        .bind(content_hash)
        .bind(chunk_count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn row_to_session(row: &PgRow) -> Result<CrawlSession> {
    Ok(CrawlSession {
        id: row.try_get("id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        dataset_id: row.try_get("dataset_id").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        status: row.try_get("status").map_err(db_err)?,
        pages_crawled: row.try_get("pages_crawled").map_err(db_err)?,
        pages_failed: row.try_get("pages_failed").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}
