use chrono::{DateTime, Utc};
use context_core::{EngineError, JobStatus, RepoJob, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

const BACKOFF_CAP_SECS: u64 = 3600;

/// Exponential retry delay: `base * 2^(attempt - 1)`, capped at one
/// hour. `attempt` is the retry count after the failure was recorded,
/// so the first retry waits exactly `base`.
pub fn backoff(base_secs: u64, attempt: u32) -> std::time::Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let secs = base_secs.saturating_mul(1u64 << exp).min(BACKOFF_CAP_SECS);
    std::time::Duration::from_secs(secs)
}

/// Parameters for a new repository ingestion job.
#[derive(Debug, Clone)]
pub struct EnqueueJob {
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub repo_url: String,
    pub branch: String,
    pub sha: Option<String>,
    pub priority: i32,
    pub max_retries: i32,
}

/// Durable PostgreSQL-backed queue for repository ingestion. Dispatch
/// uses `FOR UPDATE SKIP LOCKED` so N workers scale without contention;
/// every row mutation fires `NOTIFY github_job_updates` through the
/// schema triggers.
pub struct JobQueue {
    pool: PgPool,
    backoff_base_secs: u64,
}

impl JobQueue {
    pub fn new(pool: PgPool, backoff_base_secs: u64) -> Self {
        Self {
            pool,
            backoff_base_secs,
        }
    }

    /// Queue a job. The org/name pair is parsed out of the repository
    /// URL so consumers can render it without re-parsing.
    pub async fn enqueue(&self, job: EnqueueJob) -> Result<RepoJob> {
        let (org, name) = parse_repo_url(&job.repo_url)?;
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.github_jobs
                (project_id, dataset_id, repo_url, repo_org, repo_name,
                 branch, sha, priority, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(job.project_id)
        .bind(job.dataset_id)
        .bind(&job.repo_url)
        .bind(org)
        .bind(name)
        .bind(&job.branch)
        .bind(&job.sha)
        .bind(job.priority)
        .bind(job.max_retries)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_job(&row)
    }

    /// Atomically claim the single highest-priority pending job with
    /// `visible_at <= now`. Returns `None` when the queue is drained.
    pub async fn dispatch(&self) -> Result<Option<RepoJob>> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id FROM claude_context.github_jobs
                WHERE status = 'pending' AND visible_at <= now()
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE claude_context.github_jobs j
            SET status = 'in_progress', started_at = now(), updated_at = now()
            FROM next
            WHERE j.id = next.id
            RETURNING j.*
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Record progress. `progress` is clamped monotonically
    /// non-decreasing within a run via `GREATEST`.
    pub async fn update_progress(
        &self,
        job_id: Uuid,
        progress: i32,
        phase: &str,
        file: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE claude_context.github_jobs
            SET progress = GREATEST(progress, LEAST($2, 100)),
                current_phase = $3,
                current_file = $4,
                updated_at = now()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(progress)
        .bind(phase)
        .bind(file)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn complete(
        &self,
        job_id: Uuid,
        indexed_files: i32,
        total_chunks: i32,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE claude_context.github_jobs
            SET status = 'completed', progress = 100, completed_at = now(),
                indexed_files = $2, total_chunks = $3, updated_at = now()
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(job_id)
        .bind(indexed_files)
        .bind(total_chunks)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::conflict(format!(
                "job {job_id} is not in progress"
            )));
        }
        Ok(())
    }

    /// Record a failure. Jobs with retry budget left return to `pending`
    /// with `visible_at = now + backoff(retry_count + 1)`; exhausted jobs
    /// become terminally `failed`. Only the owning worker calls this, so
    /// reading the retry count first does not race.
    pub async fn fail(&self, job_id: Uuid, error: &str) -> Result<RepoJob> {
        let current = self.get(job_id).await?;
        let delay = backoff(self.backoff_base_secs, current.retry_count as u32 + 1);

        let row = sqlx::query(
            r#"
            UPDATE claude_context.github_jobs
            SET error = $2,
                status = CASE WHEN retry_count < max_retries
                              THEN 'pending' ELSE 'failed' END,
                visible_at = CASE WHEN retry_count < max_retries
                                  THEN now() + $3 * interval '1 second'
                                  ELSE visible_at END,
                retry_count = CASE WHEN retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                completed_at = CASE WHEN retry_count < max_retries
                                    THEN NULL ELSE now() END,
                updated_at = now()
            WHERE id = $1 AND status = 'in_progress'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(delay.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_job(&row)
    }

    /// External cancellation. Only non-terminal jobs can be cancelled;
    /// workers observe the flag at phase boundaries.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE claude_context.github_jobs
            SET status = 'cancelled', completed_at = now(), updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if updated.rows_affected() == 0 {
            return Err(EngineError::conflict(format!(
                "job {job_id} is already terminal"
            )));
        }
        Ok(())
    }

    pub async fn is_cancelled(&self, job_id: Uuid) -> Result<bool> {
        let status: String =
            sqlx::query_scalar("SELECT status FROM claude_context.github_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(status == JobStatus::Cancelled.as_str())
    }

    pub async fn get(&self, job_id: Uuid) -> Result<RepoJob> {
        let row = sqlx::query("SELECT * FROM claude_context.github_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| EngineError::not_found(format!("job {job_id}")))?;
        row_to_job(&row)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<RepoJob>> {
        let rows = sqlx::query(
            "SELECT * FROM claude_context.github_jobs
             ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }

    /// Maintenance: remove terminal rows older than the retention
    /// window. Returns the number of rows deleted.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM claude_context.github_jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at < now() - ($1 * interval '1 day')
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(deleted.rows_affected())
    }
}

/// Pull `org/repo` out of an HTTPS or SSH repository URL.
fn parse_repo_url(url: &str) -> Result<(String, String)> {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    let path = if let Some(rest) = trimmed.split_once(':').and_then(|(head, rest)| {
        // git@host:org/repo
        head.contains('@').then_some(rest)
    }) {
        rest
    } else if let Some(idx) = trimmed.find("://") {
        trimmed[idx + 3..].split_once('/').map(|(_, p)| p).unwrap_or("")
    } else {
        trimmed
    };

    let mut parts = path.rsplit('/');
    let name = parts.next().unwrap_or_default();
    let org = parts.next().unwrap_or_default();
    if org.is_empty() || name.is_empty() {
        return Err(EngineError::validation(
            format!("cannot parse org/repo from '{url}'"),
            vec!["https://github.com/org/repo".to_string()],
        ));
    }
    Ok((org.to_string(), name.to_string()))
}

fn row_to_job(row: &PgRow) -> Result<RepoJob> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(RepoJob {
        id: row.try_get("id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        dataset_id: row.try_get("dataset_id").map_err(db_err)?,
        repo_url: row.try_get("repo_url").map_err(db_err)?,
        repo_org: row.try_get("repo_org").map_err(db_err)?,
        repo_name: row.try_get("repo_name").map_err(db_err)?,
        branch: row.try_get("branch").map_err(db_err)?,
        sha: row.try_get("sha").map_err(db_err)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| EngineError::conflict(format!("unknown job status '{status}'")))?,
        progress: row.try_get("progress").map_err(db_err)?,
        current_phase: row.try_get("current_phase").map_err(db_err)?,
        current_file: row.try_get("current_file").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        retry_count: row.try_get("retry_count").map_err(db_err)?,
        max_retries: row.try_get("max_retries").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        visible_at: row.try_get::<DateTime<Utc>, _>("visible_at").map_err(db_err)?,
        indexed_files: row.try_get("indexed_files").map_err(db_err)?,
        total_chunks: row.try_get("total_chunks").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff(30, 1).as_secs(), 30);
        assert_eq!(backoff(30, 2).as_secs(), 60);
        assert_eq!(backoff(30, 3).as_secs(), 120);
        assert_eq!(backoff(30, 4).as_secs(), 240);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff(30, 16).as_secs(), BACKOFF_CAP_SECS);
        assert_eq!(backoff(30, 40).as_secs(), BACKOFF_CAP_SECS);
    }

    #[test]
    fn parses_https_urls() {
        let (org, name) = parse_repo_url("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(org, "acme");
        assert_eq!(name, "widgets");

        let (org, name) = parse_repo_url("https://github.com/acme/widgets/").unwrap();
        assert_eq!((org.as_str(), name.as_str()), ("acme", "widgets"));
    }

    #[test]
    fn parses_ssh_urls() {
        let (org, name) = parse_repo_url("git@github.com:acme/widgets.git").unwrap();
        assert_eq!(org, "acme");
        assert_eq!(name, "widgets");
    }

    #[test]
    fn rejects_unparseable_urls() {
        let err = parse_repo_url("widgets").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
