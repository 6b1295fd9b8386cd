use async_trait::async_trait;
use context_core::{ChunkPayload, EngineError, Result, VectorDocument};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{HybridHits, PayloadFilter, ScoredPoint, VectorQuery, VectorStore};
use crate::db_err;

/// Vector store materialised inside PostgreSQL with pgvector: one table
/// per collection plus a registry row in `collections_metadata`. Dense
/// search is cosine ANN; the hybrid leg ranks `tsvector` text search,
/// fused by the query planner.
pub struct PgVectorStore {
    pool: PgPool,
}

impl PgVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Collection names come out of `collection_name_for` and are safe
    /// identifiers, but everything interpolated into DDL is re-checked.
    fn table(name: &str) -> Result<String> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(EngineError::validation(
                format!("invalid collection name '{name}'"),
                vec![],
            ));
        }
        Ok(format!("claude_context.vec_{name}"))
    }

    fn vector_literal(vector: &[f32]) -> String {
        let mut out = String::with_capacity(vector.len() * 8 + 2);
        out.push('[');
        for (i, v) in vector.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&v.to_string());
        }
        out.push(']');
        out
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &PayloadFilter) {
        builder.push(" WHERE TRUE");
        if let Some(project_id) = filter.project_id {
            builder.push(" AND project_id = ").push_bind(project_id);
        }
        if !filter.dataset_ids.is_empty() {
            builder
                .push(" AND dataset_id = ANY(")
                .push_bind(filter.dataset_ids.clone())
                .push(")");
        }
        if let Some(path) = &filter.relative_path {
            builder.push(" AND relative_path = ").push_bind(path.clone());
        }
        if let Some(prefix) = &filter.path_prefix {
            builder
                .push(" AND relative_path LIKE ")
                .push_bind(format!("{}%", prefix.replace('%', "\\%")));
        }
        if let Some(source_type) = filter.source_type {
            builder
                .push(" AND source_type = ")
                .push_bind(source_type.as_str());
        }
        if let Some(repo) = &filter.repo {
            builder.push(" AND repo = ").push_bind(repo.clone());
        }
        if let Some(lang) = &filter.lang {
            builder.push(" AND lang = ").push_bind(lang.clone());
        }
    }

    fn row_to_hit(row: &PgRow) -> Result<ScoredPoint> {
        let payload: serde_json::Value = row.try_get("payload").map_err(db_err)?;
        let payload: ChunkPayload = serde_json::from_value(payload)
            .map_err(|e| EngineError::conflict(format!("undecodable payload: {e}")))?;
        Ok(ScoredPoint {
            id: row.try_get("id").map_err(db_err)?,
            score: row.try_get::<f64, _>("score").map_err(db_err)? as f32,
            payload,
        })
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn supports_hybrid(&self) -> bool {
        true
    }

    fn supports_named_vectors(&self) -> bool {
        false
    }

    async fn create_collection(&self, name: &str, dimension: usize, hybrid: bool) -> Result<()> {
        let table = Self::table(name)?;
        sqlx::query(
            "INSERT INTO claude_context.collections_metadata
                 (collection_name, dimension, is_hybrid)
             VALUES ($1, $2, $3)
             ON CONFLICT (collection_name) DO NOTHING",
        )
        .bind(name)
        .bind(dimension as i32)
        .bind(hybrid)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                embedding vector({dimension}) NOT NULL,
                summary_embedding vector({dimension}),
                project_id UUID NOT NULL,
                dataset_id UUID NOT NULL,
                source_type TEXT NOT NULL,
                relative_path TEXT NOT NULL,
                repo TEXT,
                lang TEXT,
                payload JSONB NOT NULL,
                text_search tsvector
            )
            "#
        );
        sqlx::query(&ddl).execute(&self.pool).await.map_err(db_err)?;

        let scope_idx = format!(
            "CREATE INDEX IF NOT EXISTS vec_{name}_scope_idx ON {table} (project_id, dataset_id)"
        );
        sqlx::query(&scope_idx)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        let path_idx = format!(
            "CREATE INDEX IF NOT EXISTS vec_{name}_path_idx ON {table} (dataset_id, relative_path)"
        );
        sqlx::query(&path_idx)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if hybrid {
            let fts_idx = format!(
                "CREATE INDEX IF NOT EXISTS vec_{name}_fts_idx ON {table} USING gin (text_search)"
            );
            sqlx::query(&fts_idx)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        let table = Self::table(name)?;
        sqlx::query("DELETE FROM claude_context.collections_metadata WHERE collection_name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM claude_context.collections_metadata
             WHERE collection_name = $1)",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT collection_name FROM claude_context.collections_metadata
             ORDER BY collection_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn count(&self, name: &str) -> Result<u64> {
        let table = Self::table(name)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count as u64)
    }

    async fn upsert(&self, name: &str, documents: Vec<VectorDocument>) -> Result<()> {
        let table = Self::table(name)?;
        let sql = format!(
            r#"
            INSERT INTO {table}
                (id, embedding, summary_embedding, project_id, dataset_id,
                 source_type, relative_path, repo, lang, payload, text_search)
            VALUES ($1, $2::vector, $3::vector, $4, $5, $6, $7, $8, $9, $10,
                    to_tsvector('simple', $11))
            ON CONFLICT (id) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                summary_embedding = EXCLUDED.summary_embedding,
                relative_path = EXCLUDED.relative_path,
                repo = EXCLUDED.repo,
                lang = EXCLUDED.lang,
                payload = EXCLUDED.payload,
                text_search = EXCLUDED.text_search
            "#
        );
        for doc in &documents {
            let payload = serde_json::to_value(&doc.payload)
                .map_err(|e| EngineError::conflict(format!("payload encode: {e}")))?;
            sqlx::query(&sql)
                .bind(doc.id)
                .bind(Self::vector_literal(&doc.vector))
                .bind(doc.summary_vector.as_deref().map(Self::vector_literal))
                .bind(doc.payload.project_id)
                .bind(doc.payload.dataset_id)
                .bind(doc.payload.source_type.as_str())
                .bind(&doc.payload.relative_path)
                .bind(&doc.payload.repo)
                .bind(&doc.payload.lang)
                .bind(payload)
                .bind(&doc.payload.content)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn delete_by_ids(&self, name: &str, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = Self::table(name)?;
        sqlx::query(&format!("DELETE FROM {table} WHERE id = ANY($1)"))
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_by_filter(&self, name: &str, filter: &PayloadFilter) -> Result<()> {
        let table = Self::table(name)?;
        let mut builder = QueryBuilder::new(format!("DELETE FROM {table}"));
        Self::push_filter(&mut builder, filter);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_relative_path(
        &self,
        name: &str,
        filter: &PayloadFilter,
        new_path: &str,
    ) -> Result<()> {
        let table = Self::table(name)?;
        let mut builder = QueryBuilder::new(format!("UPDATE {table} SET relative_path = "));
        builder.push_bind(new_path.to_string());
        builder.push(", payload = jsonb_set(payload, '{relative_path}', to_jsonb(");
        builder.push_bind(new_path.to_string());
        builder.push("::text))");
        Self::push_filter(&mut builder, filter);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn search(&self, name: &str, query: &VectorQuery) -> Result<Vec<ScoredPoint>> {
        let table = Self::table(name)?;
        let mut builder = QueryBuilder::new("SELECT id, payload, (1 - (embedding <=> ");
        builder.push_bind(Self::vector_literal(&query.vector));
        builder.push("::vector))::float8 AS score FROM ");
        builder.push(table);
        Self::push_filter(&mut builder, &query.filter);
        builder.push(" ORDER BY score DESC LIMIT ");
        builder.push_bind(query.limit as i64);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_hit).collect()
    }

    async fn hybrid_search(&self, name: &str, query: &VectorQuery) -> Result<HybridHits> {
        let dense = self.search(name, query).await?;
        let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(HybridHits::Fused(dense));
        };

        let table = Self::table(name)?;
        let mut builder =
            QueryBuilder::new("SELECT id, payload, ts_rank(text_search, plainto_tsquery('simple', ");
        builder.push_bind(text.to_string());
        builder.push("))::float8 AS score FROM ");
        builder.push(table);
        Self::push_filter(&mut builder, &query.filter);
        builder.push(" AND text_search @@ plainto_tsquery('simple', ");
        builder.push_bind(text.to_string());
        builder.push(") ORDER BY score DESC LIMIT ");
        builder.push_bind(query.limit as i64);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let sparse = rows
            .iter()
            .map(Self::row_to_hit)
            .collect::<Result<Vec<_>>>()?;
        Ok(HybridHits::Split { dense, sparse })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_validated() {
        assert_eq!(
            PgVectorStore::table("ds_0a1b2c3d4e5f6071_p").unwrap(),
            "claude_context.vec_ds_0a1b2c3d4e5f6071_p"
        );
        assert!(PgVectorStore::table("bad-name").is_err());
        assert!(PgVectorStore::table("Robert'); DROP TABLE x;--").is_err());
        assert!(PgVectorStore::table("").is_err());
    }

    #[test]
    fn vector_literal_format() {
        assert_eq!(PgVectorStore::vector_literal(&[1.0, -0.5]), "[1,-0.5]");
        assert_eq!(PgVectorStore::vector_literal(&[]), "[]");
    }
}
