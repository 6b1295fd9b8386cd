use async_trait::async_trait;
use context_core::{DatasetCollection, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// Read-side lookup of a dataset's collection row, consumed by the
/// query planner.
#[async_trait]
pub trait CollectionRead: Send + Sync {
    async fn collection_for(&self, dataset_id: Uuid) -> Result<Option<DatasetCollection>>;
}

/// One row per dataset mapping it to its single vector collection.
/// `point_count` here is cache-only: refreshed after syncs and by the
/// vector-store monitor, never consulted for correctness.
pub struct CollectionRegistry {
    pool: PgPool,
}

impl CollectionRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register (or confirm) the collection for a dataset. The dimension
    /// is recorded on first registration and not silently changed.
    pub async fn ensure(
        &self,
        dataset_id: Uuid,
        collection_name: &str,
        dimension: i32,
        is_hybrid: bool,
    ) -> Result<DatasetCollection> {
        let row = sqlx::query(
            r#"
            INSERT INTO claude_context.dataset_collections
                (dataset_id, collection_name, dimension, is_hybrid)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dataset_id) DO UPDATE SET collection_name = EXCLUDED.collection_name
            RETURNING dataset_id, collection_name, dimension, is_hybrid,
                      point_count, last_indexed_at
            "#,
        )
        .bind(dataset_id)
        .bind(collection_name)
        .bind(dimension)
        .bind(is_hybrid)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row_to_collection(&row)
    }

    pub async fn get(&self, dataset_id: Uuid) -> Result<Option<DatasetCollection>> {
        let row = sqlx::query(
            "SELECT dataset_id, collection_name, dimension, is_hybrid,
                    point_count, last_indexed_at
             FROM claude_context.dataset_collections WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|r| row_to_collection(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<DatasetCollection>> {
        let rows = sqlx::query(
            "SELECT dataset_id, collection_name, dimension, is_hybrid,
                    point_count, last_indexed_at
             FROM claude_context.dataset_collections ORDER BY collection_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_collection).collect()
    }

    /// Refresh the cached point count and stamp `last_indexed_at`.
    pub async fn record_indexed(&self, dataset_id: Uuid, point_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE claude_context.dataset_collections
             SET point_count = $2, last_indexed_at = now()
             WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .bind(point_count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Cache refresh from the vector-store monitor (no indexing stamp).
    pub async fn set_point_count(&self, collection_name: &str, point_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE claude_context.dataset_collections
             SET point_count = $2 WHERE collection_name = $1",
        )
        .bind(collection_name)
        .bind(point_count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl CollectionRead for CollectionRegistry {
    async fn collection_for(&self, dataset_id: Uuid) -> Result<Option<DatasetCollection>> {
        self.get(dataset_id).await
    }
}

fn row_to_collection(row: &PgRow) -> Result<DatasetCollection> {
    Ok(DatasetCollection {
        dataset_id: row.try_get("dataset_id").map_err(db_err)?,
        collection_name: row.try_get("collection_name").map_err(db_err)?,
        dimension: row.try_get("dimension").map_err(db_err)?,
        is_hybrid: row.try_get("is_hybrid").map_err(db_err)?,
        point_count: row.try_get("point_count").map_err(db_err)?,
        last_indexed_at: row.try_get("last_indexed_at").map_err(db_err)?,
    })
}
