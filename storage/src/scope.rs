use async_trait::async_trait;
use context_core::{Dataset, DatasetScope, EngineError, Project, ResourceType, Result};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// Read-side scope contract consumed by the query planner. Backed by
/// `ScopeManager` in production and by fixed maps in tests.
#[async_trait]
pub trait ScopeRead: Send + Sync {
    /// Look up a project without creating it.
    async fn project_by_name(&self, name: &str) -> Result<Option<Project>>;
    /// Datasets visible from a project: owned, global, or shared.
    async fn visible_datasets(&self, project_id: Uuid) -> Result<Vec<Dataset>>;
    /// Owner name of a project id, for labelling shared results.
    async fn project_name(&self, project_id: Uuid) -> Result<Option<String>>;
}

/// Derive the vector collection name for a dataset. Deterministic and
/// stateless: the same `(project_id, dataset_id)` always yields the same
/// name, and distinct pairs cannot collide short of a SHA-256 prefix
/// collision.
pub fn collection_name_for(project_id: Uuid, dataset_id: Uuid, scope: DatasetScope) -> String {
    let digest = Sha256::digest(format!("{project_id}:{dataset_id}").as_bytes());
    format!("ds_{}_{}", hex::encode(&digest[..8]), scope.tag())
}

/// Resolves project and dataset names to durable identifiers and
/// enforces the sharing/visibility rules. All name resolution is
/// create-on-miss.
pub struct ScopeManager {
    pool: PgPool,
}

impl ScopeManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a project by name, creating it on first reference.
    /// The reserved name `global` marks the project globally visible.
    pub async fn resolve_project(&self, name: &str) -> Result<Project> {
        if name.is_empty() {
            return Err(EngineError::validation("project name is empty", vec![]));
        }
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.projects (name, is_global)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET updated_at = now()
            RETURNING id, name, is_global, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(name == "global")
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_project(&row)
    }

    /// Look up a project without creating it.
    pub async fn find_project(&self, name: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, name, is_global, created_at, updated_at
             FROM claude_context.projects WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_project(&r)).transpose()
    }

    /// Resolve a dataset within a project, creating it on first
    /// reference. `scope_hint` only applies to a newly created dataset.
    pub async fn resolve_dataset(
        &self,
        project_id: Uuid,
        name: &str,
        scope_hint: Option<DatasetScope>,
    ) -> Result<Dataset> {
        if name.is_empty() {
            return Err(EngineError::validation("dataset name is empty", vec![]));
        }
        let scope = scope_hint.unwrap_or(DatasetScope::Project);
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.datasets (project_id, name, scope, is_global)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (project_id, name) DO UPDATE SET updated_at = now()
            RETURNING id, project_id, name, is_global, scope, created_at, updated_at
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(scope.as_str())
        .bind(scope == DatasetScope::Global)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_dataset(&row)
    }

    pub async fn dataset_by_id(&self, dataset_id: Uuid) -> Result<Option<Dataset>> {
        let row = sqlx::query(
            "SELECT id, project_id, name, is_global, scope, created_at, updated_at
             FROM claude_context.datasets WHERE id = $1",
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_dataset(&r)).transpose()
    }

    /// Datasets visible from `project_id`: owned, globally shared, or
    /// explicitly shared with read access.
    pub async fn accessible_datasets(&self, project_id: Uuid) -> Result<Vec<Dataset>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT d.id, d.project_id, d.name, d.is_global, d.scope,
                            d.created_at, d.updated_at
            FROM claude_context.datasets d
            LEFT JOIN claude_context.project_shares s
              ON s.resource_id = d.id
             AND s.resource_type = 'dataset'
             AND s.target_project_id = $1
             AND s.can_read
            WHERE d.project_id = $1 OR d.is_global OR s.id IS NOT NULL
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_dataset).collect()
    }

    /// Whether one resource is visible from a project.
    pub async fn is_accessible(
        &self,
        project_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    ) -> Result<bool> {
        let accessible = match resource_type {
            ResourceType::Dataset => sqlx::query_scalar::<_, bool>(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM claude_context.datasets d
                    LEFT JOIN claude_context.project_shares s
                      ON s.resource_id = d.id
                     AND s.resource_type = 'dataset'
                     AND s.target_project_id = $1
                     AND s.can_read
                    WHERE d.id = $2
                      AND (d.project_id = $1 OR d.is_global OR s.id IS NOT NULL)
                )
                "#,
            )
            .bind(project_id)
            .bind(resource_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?,
            ResourceType::Project => sqlx::query_scalar::<_, bool>(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM claude_context.projects p
                    LEFT JOIN claude_context.project_shares s
                      ON s.resource_id = p.id
                     AND s.resource_type = 'project'
                     AND s.target_project_id = $1
                     AND s.can_read
                    WHERE p.id = $2
                      AND (p.id = $1 OR p.is_global OR s.id IS NOT NULL)
                )
                "#,
            )
            .bind(project_id)
            .bind(resource_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?,
        };
        Ok(accessible)
    }
}

#[async_trait]
impl ScopeRead for ScopeManager {
    async fn project_by_name(&self, name: &str) -> Result<Option<Project>> {
        self.find_project(name).await
    }

    async fn visible_datasets(&self, project_id: Uuid) -> Result<Vec<Dataset>> {
        self.accessible_datasets(project_id).await
    }

    async fn project_name(&self, project_id: Uuid) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT name FROM claude_context.projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }
}

fn row_to_project(row: &PgRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        is_global: row.try_get("is_global").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn row_to_dataset(row: &PgRow) -> Result<Dataset> {
    let scope: String = row.try_get("scope").map_err(db_err)?;
    Ok(Dataset {
        id: row.try_get("id").map_err(db_err)?,
        project_id: row.try_get("project_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        is_global: row.try_get("is_global").map_err(db_err)?,
        scope: DatasetScope::parse(&scope).unwrap_or(DatasetScope::Project),
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}
