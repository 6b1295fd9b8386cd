use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use context_core::{IndexedFile, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db_err;

/// Per-language aggregate over a dataset's indexed files.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LanguageStat {
    pub language: String,
    pub files: i64,
    pub chunks: i64,
}

/// CRUD over the `indexed_files` table, keyed by
/// `(project_id, dataset_id, relative_path)`. Injected into the sync
/// engine as a trait so tests and ephemeral ingestion runs can use the
/// in-memory twin.
#[async_trait]
pub trait FileIndex: Send + Sync {
    async fn upsert(&self, file: &IndexedFile) -> Result<()>;

    /// Rename: move the row to a new path without touching hashes.
    async fn update_path(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
        old_path: &str,
        new_path: &str,
    ) -> Result<()>;

    async fn remove(&self, project_id: Uuid, dataset_id: Uuid, path: &str) -> Result<()>;

    async fn get_all(&self, project_id: Uuid, dataset_id: Uuid) -> Result<Vec<IndexedFile>>;

    async fn clear_dataset(&self, project_id: Uuid, dataset_id: Uuid) -> Result<()>;

    async fn stats_by_language(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
    ) -> Result<Vec<LanguageStat>>;
}

pub struct PgFileIndex {
    pool: PgPool,
}

impl PgFileIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FileIndex for PgFileIndex {
    async fn upsert(&self, file: &IndexedFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO claude_context.indexed_files
                (project_id, dataset_id, relative_path, sha256_hash, file_size,
                 chunk_count, language, collection_name)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (project_id, dataset_id, relative_path) DO UPDATE SET
                sha256_hash = EXCLUDED.sha256_hash,
                file_size = EXCLUDED.file_size,
                chunk_count = EXCLUDED.chunk_count,
                language = EXCLUDED.language,
                collection_name = EXCLUDED.collection_name,
                updated_at = now()
            "#,
        )
        .bind(file.project_id)
        .bind(file.dataset_id)
        .bind(&file.relative_path)
        .bind(&file.sha256_hash)
        .bind(file.file_size)
        .bind(file.chunk_count)
        .bind(&file.language)
        .bind(&file.collection_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_path(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE claude_context.indexed_files
            SET relative_path = $4, updated_at = now()
            WHERE project_id = $1 AND dataset_id = $2 AND relative_path = $3
            "#,
        )
        .bind(project_id)
        .bind(dataset_id)
        .bind(old_path)
        .bind(new_path)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove(&self, project_id: Uuid, dataset_id: Uuid, path: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM claude_context.indexed_files
             WHERE project_id = $1 AND dataset_id = $2 AND relative_path = $3",
        )
        .bind(project_id)
        .bind(dataset_id)
        .bind(path)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_all(&self, project_id: Uuid, dataset_id: Uuid) -> Result<Vec<IndexedFile>> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, dataset_id, relative_path, sha256_hash, file_size,
                   chunk_count, language, collection_name, created_at, updated_at
            FROM claude_context.indexed_files
            WHERE project_id = $1 AND dataset_id = $2
            ORDER BY relative_path
            "#,
        )
        .bind(project_id)
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_file).collect()
    }

    async fn clear_dataset(&self, project_id: Uuid, dataset_id: Uuid) -> Result<()> {
        sqlx::query(
            "DELETE FROM claude_context.indexed_files
             WHERE project_id = $1 AND dataset_id = $2",
        )
        .bind(project_id)
        .bind(dataset_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn stats_by_language(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
    ) -> Result<Vec<LanguageStat>> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(language, 'unknown') AS language,
                   COUNT(*) AS files,
                   COALESCE(SUM(chunk_count), 0) AS chunks
            FROM claude_context.indexed_files
            WHERE project_id = $1 AND dataset_id = $2
            GROUP BY 1
            ORDER BY files DESC
            "#,
        )
        .bind(project_id)
        .bind(dataset_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                Ok(LanguageStat {
                    language: row.try_get("language").map_err(db_err)?,
                    files: row.try_get("files").map_err(db_err)?,
                    chunks: row.try_get("chunks").map_err(db_err)?,
                })
            })
            .collect()
    }
}

fn row_to_file(row: &PgRow) -> Result<IndexedFile> {
    Ok(IndexedFile {
        project_id: row.try_get("project_id").map_err(db_err)?,
        dataset_id: row.try_get("dataset_id").map_err(db_err)?,
        relative_path: row.try_get("relative_path").map_err(db_err)?,
        sha256_hash: row.try_get("sha256_hash").map_err(db_err)?,
        file_size: row.try_get("file_size").map_err(db_err)?,
        chunk_count: row.try_get("chunk_count").map_err(db_err)?,
        language: row.try_get("language").map_err(db_err)?,
        collection_name: row.try_get("collection_name").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

/// In-memory `FileIndex`. Backs ephemeral ingestion runs (a fresh clone
/// is always all-created) and the engine's unit tests.
#[derive(Default)]
pub struct MemoryFileIndex {
    rows: Mutex<HashMap<(Uuid, Uuid, String), IndexedFile>>,
}

impl MemoryFileIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileIndex for MemoryFileIndex {
    async fn upsert(&self, file: &IndexedFile) -> Result<()> {
        let key = (file.project_id, file.dataset_id, file.relative_path.clone());
        let mut rows = self.rows.lock().unwrap();
        let mut stored = file.clone();
        if let Some(existing) = rows.get(&key) {
            stored.created_at = existing.created_at;
        }
        stored.updated_at = Utc::now();
        rows.insert(key, stored);
        Ok(())
    }

    async fn update_path(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(mut file) = rows.remove(&(project_id, dataset_id, old_path.to_string())) {
            file.relative_path = new_path.to_string();
            file.updated_at = Utc::now();
            rows.insert((project_id, dataset_id, new_path.to_string()), file);
        }
        Ok(())
    }

    async fn remove(&self, project_id: Uuid, dataset_id: Uuid, path: &str) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .remove(&(project_id, dataset_id, path.to_string()));
        Ok(())
    }

    async fn get_all(&self, project_id: Uuid, dataset_id: Uuid) -> Result<Vec<IndexedFile>> {
        let rows = self.rows.lock().unwrap();
        let mut files: Vec<IndexedFile> = rows
            .values()
            .filter(|f| f.project_id == project_id && f.dataset_id == dataset_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(files)
    }

    async fn clear_dataset(&self, project_id: Uuid, dataset_id: Uuid) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .retain(|(p, d, _), _| !(*p == project_id && *d == dataset_id));
        Ok(())
    }

    async fn stats_by_language(
        &self,
        project_id: Uuid,
        dataset_id: Uuid,
    ) -> Result<Vec<LanguageStat>> {
        let rows = self.rows.lock().unwrap();
        let mut by_language: HashMap<String, (i64, i64)> = HashMap::new();
        for file in rows
            .values()
            .filter(|f| f.project_id == project_id && f.dataset_id == dataset_id)
        {
            let key = file.language.clone().unwrap_or_else(|| "unknown".to_string());
            let entry = by_language.entry(key).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += file.chunk_count as i64;
        }
        let mut stats: Vec<LanguageStat> = by_language
            .into_iter()
            .map(|(language, (files, chunks))| LanguageStat {
                language,
                files,
                chunks,
            })
            .collect();
        stats.sort_by(|a, b| b.files.cmp(&a.files));
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(project: Uuid, dataset: Uuid, path: &str, hash: &str) -> IndexedFile {
        IndexedFile {
            project_id: project,
            dataset_id: dataset,
            relative_path: path.to_string(),
            sha256_hash: hash.to_string(),
            file_size: 10,
            chunk_count: 2,
            language: context_core::language_for_path(path).map(str::to_string),
            collection_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_update_remove_round_trip() {
        let index = MemoryFileIndex::new();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());

        index.upsert(&file(p, d, "a.py", "h1")).await.unwrap();
        index.upsert(&file(p, d, "a.py", "h2")).await.unwrap();
        let all = index.get_all(p, d).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].sha256_hash, "h2");

        index.remove(p, d, "a.py").await.unwrap();
        assert!(index.get_all(p, d).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_path_preserves_hash() {
        let index = MemoryFileIndex::new();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        index.upsert(&file(p, d, "old.rs", "h1")).await.unwrap();
        index.update_path(p, d, "old.rs", "new.rs").await.unwrap();

        let all = index.get_all(p, d).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].relative_path, "new.rs");
        assert_eq!(all[0].sha256_hash, "h1");
    }

    #[tokio::test]
    async fn datasets_are_isolated() {
        let index = MemoryFileIndex::new();
        let p = Uuid::new_v4();
        let (d1, d2) = (Uuid::new_v4(), Uuid::new_v4());
        index.upsert(&file(p, d1, "a.py", "h1")).await.unwrap();
        index.upsert(&file(p, d2, "b.py", "h2")).await.unwrap();

        index.clear_dataset(p, d1).await.unwrap();
        assert!(index.get_all(p, d1).await.unwrap().is_empty());
        assert_eq!(index.get_all(p, d2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn language_stats_aggregate() {
        let index = MemoryFileIndex::new();
        let (p, d) = (Uuid::new_v4(), Uuid::new_v4());
        index.upsert(&file(p, d, "a.py", "h1")).await.unwrap();
        index.upsert(&file(p, d, "b.py", "h2")).await.unwrap();
        index.upsert(&file(p, d, "c.rs", "h3")).await.unwrap();

        let stats = index.stats_by_language(p, d).await.unwrap();
        assert_eq!(stats[0].language, "python");
        assert_eq!(stats[0].files, 2);
        assert_eq!(stats[0].chunks, 4);
    }
}
