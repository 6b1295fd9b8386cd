use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use context_core::{language_for_path, IndexedFile, Result};
use storage::FileIndex;
use uuid::Uuid;

use crate::hash::HashCalculator;
use crate::matcher::IgnoreMatcher;

/// One file in the change plan.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub file_size: u64,
    pub language: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RenamedFile {
    pub old_path: String,
    pub new_path: String,
    pub absolute_path: PathBuf,
    pub hash: String,
}

/// The diff between the working tree and the metadata store. Produced
/// without side effects: a pure function of disk and database state.
#[derive(Debug, Default)]
pub struct ChangeSummary {
    pub created: Vec<FileChange>,
    pub modified: Vec<FileChange>,
    pub deleted: Vec<FileChange>,
    pub renamed: Vec<RenamedFile>,
    pub unchanged: Vec<String>,
    pub scan_duration: Duration,
}

impl ChangeSummary {
    pub fn has_changes(&self) -> bool {
        !(self.created.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty())
    }

    pub fn total_changes(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len() + self.renamed.len()
    }
}

/// Diffs a working tree against stored file metadata and classifies
/// every admitted file as created, modified, unchanged or deleted, with
/// an optional rename pass that pairs created/deleted files by hash.
pub struct ChangeDetector {
    hasher: HashCalculator,
}

impl ChangeDetector {
    pub fn new(max_hash_concurrency: usize) -> Self {
        Self {
            hasher: HashCalculator::new(max_hash_concurrency),
        }
    }

    pub async fn detect(
        &self,
        root: &Path,
        project_id: Uuid,
        dataset_id: Uuid,
        file_index: &dyn FileIndex,
        detect_renames: bool,
    ) -> Result<ChangeSummary> {
        let started = Instant::now();

        let matcher = IgnoreMatcher::new(root)?;
        let admitted = matcher.walk();
        let hashes = self.hasher.hash_all(admitted).await;

        let stored = file_index.get_all(project_id, dataset_id).await?;
        let mut stored_by_path: HashMap<String, IndexedFile> = stored
            .into_iter()
            .map(|f| (f.relative_path.clone(), f))
            .collect();

        let mut summary = ChangeSummary::default();

        for (absolute_path, new_hash) in hashes {
            let relative_path = relative_of(root, &absolute_path);
            let file_size = std::fs::metadata(&absolute_path)
                .map(|m| m.len())
                .unwrap_or(0);
            let language = language_for_path(&relative_path).map(str::to_string);

            match stored_by_path.remove(&relative_path) {
                None => summary.created.push(FileChange {
                    relative_path,
                    absolute_path,
                    old_hash: None,
                    new_hash: Some(new_hash),
                    file_size,
                    language,
                }),
                Some(existing) if existing.sha256_hash == new_hash => {
                    summary.unchanged.push(relative_path);
                }
                Some(existing) => summary.modified.push(FileChange {
                    relative_path,
                    absolute_path,
                    old_hash: Some(existing.sha256_hash),
                    new_hash: Some(new_hash),
                    file_size,
                    language,
                }),
            }
        }

        // Whatever the walk did not visit no longer exists on disk.
        for (relative_path, existing) in stored_by_path {
            summary.deleted.push(FileChange {
                absolute_path: root.join(&relative_path),
                relative_path,
                old_hash: Some(existing.sha256_hash),
                new_hash: None,
                file_size: existing.file_size as u64,
                language: existing.language,
            });
        }

        if detect_renames {
            merge_renames(&mut summary);
        }

        summary.unchanged.sort();
        summary.created.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        summary.modified.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        summary.deleted.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        summary.scan_duration = started.elapsed();
        Ok(summary)
    }
}

/// Pair created and deleted entries sharing a content hash and emit
/// them as renames. Each deleted file is consumed at most once.
fn merge_renames(summary: &mut ChangeSummary) {
    let mut deleted_by_hash: HashMap<String, Vec<FileChange>> = HashMap::new();
    for change in summary.deleted.drain(..) {
        if let Some(hash) = change.old_hash.clone() {
            deleted_by_hash.entry(hash).or_default().push(change);
        }
    }

    let mut still_created = Vec::new();
    for created in summary.created.drain(..) {
        let hash = created.new_hash.clone().unwrap_or_default();
        match deleted_by_hash.get_mut(&hash).and_then(Vec::pop) {
            Some(deleted) => summary.renamed.push(RenamedFile {
                old_path: deleted.relative_path,
                new_path: created.relative_path,
                absolute_path: created.absolute_path,
                hash,
            }),
            None => still_created.push(created),
        }
    }

    summary.created = still_created;
    summary.deleted = deleted_by_hash.into_values().flatten().collect();
}

fn relative_of(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use storage::MemoryFileIndex;
    use tempfile::TempDir;

    fn stored(project: Uuid, dataset: Uuid, path: &str, content: &str) -> IndexedFile {
        IndexedFile {
            project_id: project,
            dataset_id: dataset,
            relative_path: path.to_string(),
            sha256_hash: HashCalculator::hash_string(content),
            file_size: content.len() as i64,
            chunk_count: 1,
            language: language_for_path(path).map(str::to_string),
            collection_name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn classifies_created_modified_deleted_unchanged() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.py"), "alpha").unwrap();
        std::fs::write(root.join("b.py"), "beta").unwrap();

        let (project, dataset) = (Uuid::new_v4(), Uuid::new_v4());
        let index = MemoryFileIndex::new();
        index.upsert(&stored(project, dataset, "a.py", "alpha")).await.unwrap();
        index.upsert(&stored(project, dataset, "c.py", "gamma")).await.unwrap();

        let detector = ChangeDetector::new(4);
        let summary = detector
            .detect(root, project, dataset, &index, false)
            .await
            .unwrap();

        assert_eq!(summary.created.len(), 1);
        assert_eq!(summary.created[0].relative_path, "b.py");
        assert!(summary.modified.is_empty());
        assert_eq!(summary.deleted.len(), 1);
        assert_eq!(summary.deleted[0].relative_path, "c.py");
        assert_eq!(summary.unchanged, vec!["a.py".to_string()]);
        assert!(summary.renamed.is_empty());
    }

    #[tokio::test]
    async fn detects_modification_by_hash() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.py"), "changed").unwrap();

        let (project, dataset) = (Uuid::new_v4(), Uuid::new_v4());
        let index = MemoryFileIndex::new();
        index.upsert(&stored(project, dataset, "a.py", "original")).await.unwrap();

        let detector = ChangeDetector::new(4);
        let summary = detector
            .detect(root, project, dataset, &index, false)
            .await
            .unwrap();

        assert_eq!(summary.modified.len(), 1);
        assert_eq!(
            summary.modified[0].old_hash.as_deref(),
            Some(HashCalculator::hash_string("original").as_str())
        );
        assert_eq!(
            summary.modified[0].new_hash.as_deref(),
            Some(HashCalculator::hash_string("changed").as_str())
        );
    }

    #[tokio::test]
    async fn rename_pass_pairs_by_hash() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("x")).unwrap();
        std::fs::write(root.join("x/new.py"), "same body").unwrap();

        let (project, dataset) = (Uuid::new_v4(), Uuid::new_v4());
        let index = MemoryFileIndex::new();
        index
            .upsert(&stored(project, dataset, "x/old.py", "same body"))
            .await
            .unwrap();

        let detector = ChangeDetector::new(4);
        let summary = detector
            .detect(root, project, dataset, &index, true)
            .await
            .unwrap();

        assert!(summary.created.is_empty());
        assert!(summary.deleted.is_empty());
        assert_eq!(summary.renamed.len(), 1);
        assert_eq!(summary.renamed[0].old_path, "x/old.py");
        assert_eq!(summary.renamed[0].new_path, "x/new.py");
    }

    #[tokio::test]
    async fn rename_pass_off_keeps_create_and_delete() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("new.py"), "same body").unwrap();

        let (project, dataset) = (Uuid::new_v4(), Uuid::new_v4());
        let index = MemoryFileIndex::new();
        index
            .upsert(&stored(project, dataset, "old.py", "same body"))
            .await
            .unwrap();

        let detector = ChangeDetector::new(4);
        let summary = detector
            .detect(root, project, dataset, &index, false)
            .await
            .unwrap();
        assert_eq!(summary.created.len(), 1);
        assert_eq!(summary.deleted.len(), 1);
        assert!(summary.renamed.is_empty());
    }
}
