use context_core::Result;
use sqlx::{PgPool, Row};

use crate::db_err;

/// Per-project rollup for the metadata snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProjectStat {
    pub name: String,
    pub datasets: i64,
    pub chunks: i64,
    #[serde(rename = "webPages")]
    pub web_pages: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RecentCrawl {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub project: String,
    pub dataset: String,
    pub status: String,
    #[serde(rename = "pagesCrawled")]
    pub pages_crawled: i32,
    #[serde(rename = "pagesFailed")]
    pub pages_failed: i32,
    #[serde(rename = "durationMs")]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub projects: Vec<ProjectStat>,
    #[serde(rename = "recentCrawls")]
    pub recent_crawls: Vec<RecentCrawl>,
}

/// Short aggregate queries behind the metadata monitor. Kept separate
/// from the CRUD stores so the monitor owns no table of its own.
pub struct StatsReader {
    pool: PgPool,
}

impl StatsReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn snapshot(&self) -> Result<StatsSnapshot> {
        let project_rows = sqlx::query(
            r#"
            SELECT p.name,
                   COUNT(DISTINCT d.id) AS datasets,
                   COALESCE(SUM(dc.point_count), 0) AS chunks,
                   (SELECT COUNT(*) FROM claude_context.web_pages w
                    WHERE w.project_id = p.id) AS web_pages
            FROM claude_context.projects p
            LEFT JOIN claude_context.datasets d ON d.project_id = p.id
            LEFT JOIN claude_context.dataset_collections dc ON dc.dataset_id = d.id
            GROUP BY p.id, p.name
            ORDER BY p.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let projects = project_rows
            .iter()
            .map(|row| {
                Ok(ProjectStat {
                    name: row.try_get("name").map_err(db_err)?,
                    datasets: row.try_get("datasets").map_err(db_err)?,
                    chunks: row.try_get("chunks").map_err(db_err)?,
                    web_pages: row.try_get("web_pages").map_err(db_err)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let crawl_rows = sqlx::query(
            r#"
            SELECT c.external_id, p.name AS project, d.name AS dataset, c.status,
                   c.pages_crawled, c.pages_failed,
                   (EXTRACT(EPOCH FROM (COALESCE(c.completed_at, now()) - c.started_at)) * 1000)::bigint
                       AS duration_ms
            FROM claude_context.crawl_sessions c
            JOIN claude_context.datasets d ON d.id = c.dataset_id
            JOIN claude_context.projects p ON p.id = c.project_id
            ORDER BY c.started_at DESC
            LIMIT 20
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let recent_crawls = crawl_rows
            .iter()
            .map(|row| {
                Ok(RecentCrawl {
                    session_id: row.try_get("external_id").map_err(db_err)?,
                    project: row.try_get("project").map_err(db_err)?,
                    dataset: row.try_get("dataset").map_err(db_err)?,
                    status: row.try_get("status").map_err(db_err)?,
                    pages_crawled: row.try_get("pages_crawled").map_err(db_err)?,
                    pages_failed: row.try_get("pages_failed").map_err(db_err)?,
                    duration_ms: row.try_get("duration_ms").map_err(db_err)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(StatsSnapshot {
            projects,
            recent_crawls,
        })
    }
}
