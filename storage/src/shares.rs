use context_core::{EngineError, ProjectShare, ResourceType, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// Explicit cross-project grants. Self-shares are rejected before they
/// reach the check constraint so callers get a clean conflict error.
pub struct ShareStore {
    pool: PgPool,
}

impl ShareStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn grant(
        &self,
        source_project_id: Uuid,
        target_project_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
        can_read: bool,
        can_write: bool,
    ) -> Result<ProjectShare> {
        if source_project_id == target_project_id {
            return Err(EngineError::conflict("a project cannot share with itself"));
        }
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.project_shares
                (source_project_id, target_project_id, resource_type,
                 resource_id, can_read, can_write)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_project_id, target_project_id, resource_type, resource_id)
            DO UPDATE SET can_read = EXCLUDED.can_read, can_write = EXCLUDED.can_write
            RETURNING id, source_project_id, target_project_id, resource_type,
                      resource_id, can_read, can_write, created_at
            "#,
        )
        .bind(source_project_id)
        .bind(target_project_id)
        .bind(resource_type.as_str())
        .bind(resource_id)
        .bind(can_read)
        .bind(can_write)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_share(&row)
    }

    pub async fn revoke(
        &self,
        source_project_id: Uuid,
        target_project_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM claude_context.project_shares
             WHERE source_project_id = $1 AND target_project_id = $2
               AND resource_type = $3 AND resource_id = $4",
        )
        .bind(source_project_id)
        .bind(target_project_id)
        .bind(resource_type.as_str())
        .bind(resource_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn granted_to(&self, target_project_id: Uuid) -> Result<Vec<ProjectShare>> {
        let rows = sqlx::query(
            "SELECT id, source_project_id, target_project_id, resource_type,
                    resource_id, can_read, can_write, created_at
             FROM claude_context.project_shares
             WHERE target_project_id = $1
             ORDER BY created_at",
        )
        .bind(target_project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_share).collect()
    }
}

fn row_to_share(row: &PgRow) -> Result<ProjectShare> {
    let resource_type: String = row.try_get("resource_type").map_err(db_err)?;
    Ok(ProjectShare {
        id: row.try_get("id").map_err(db_err)?,
        source_project_id: row.try_get("source_project_id").map_err(db_err)?,
        target_project_id: row.try_get("target_project_id").map_err(db_err)?,
        resource_type: ResourceType::parse(&resource_type).ok_or_else(|| {
            EngineError::conflict(format!("unknown resource type '{resource_type}'"))
        })?,
        resource_id: row.try_get("resource_id").map_err(db_err)?,
        can_read: row.try_get("can_read").map_err(db_err)?,
        can_write: row.try_get("can_write").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
