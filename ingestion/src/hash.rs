use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use context_core::{EngineError, Result};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::warn;

/// Files at or below this size are hashed from one in-memory read;
/// anything larger streams in fixed-size reads.
const IN_MEMORY_LIMIT: u64 = 10 * 1024 * 1024;
const STREAM_BUF: usize = 64 * 1024;

/// Lowercase-hex SHA-256 of file contents, with bounded-parallel batch
/// hashing. The whole batch never holds more than `max_concurrency`
/// open file handles.
pub struct HashCalculator {
    max_concurrency: usize,
}

impl HashCalculator {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn hash_bytes(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Pure helper for tests and deterministic ids.
    pub fn hash_string(data: &str) -> String {
        Self::hash_bytes(data.as_bytes())
    }

    pub async fn hash_file(path: &Path) -> Result<String> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| EngineError::transient(format!("stat {path:?}: {e}")))?;

        if meta.len() <= IN_MEMORY_LIMIT {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| EngineError::transient(format!("read {path:?}: {e}")))?;
            return Ok(Self::hash_bytes(&data));
        }

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| EngineError::transient(format!("open {path:?}: {e}")))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; STREAM_BUF];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::transient(format!("read {path:?}: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Hash a batch of files. Failures are logged and omitted from the
    /// result rather than mapped to an empty hash.
    pub async fn hash_all(&self, paths: Vec<PathBuf>) -> HashMap<PathBuf, String> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let tasks: Vec<_> = paths
            .into_iter()
            .map(|path| {
                let semaphore = Arc::clone(&semaphore);
                tokio::spawn(async move {
                    // Holding the permit across the whole hash bounds
                    // open file handles, not just task starts.
                    let _permit = semaphore.acquire_owned().await.ok()?;
                    match Self::hash_file(&path).await {
                        Ok(hash) => Some((path, hash)),
                        Err(e) => {
                            warn!("skipping unhashable file {:?}: {}", path, e);
                            None
                        }
                    }
                })
            })
            .collect();

        let mut hashes = HashMap::new();
        for task in tasks {
            if let Ok(Some((path, hash))) = task.await {
                hashes.insert(path, hash);
            }
        }
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn hash_is_stable_and_sensitive() {
        let a = HashCalculator::hash_string("hello world");
        let b = HashCalculator::hash_string("hello world");
        let c = HashCalculator::hash_string("hello worle");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            HashCalculator::hash_string(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn file_hash_matches_string_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"content")
            .unwrap();

        let hashed = HashCalculator::hash_file(&path).await.unwrap();
        assert_eq!(hashed, HashCalculator::hash_string("content"));
    }

    #[tokio::test]
    async fn batch_omits_failures() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "data").unwrap();
        let missing = dir.path().join("missing.txt");

        let calculator = HashCalculator::new(4);
        let hashes = calculator.hash_all(vec![good.clone(), missing]).await;
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains_key(&good));
    }

    #[tokio::test]
    async fn batch_hashes_many_files() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..20 {
            let path = dir.path().join(format!("f{i}.txt"));
            std::fs::write(&path, format!("content {i}")).unwrap();
            paths.push(path);
        }

        let calculator = HashCalculator::new(3);
        let hashes = calculator.hash_all(paths.clone()).await;
        assert_eq!(hashes.len(), 20);
        assert_eq!(
            hashes[&paths[0]],
            HashCalculator::hash_string("content 0")
        );
    }
}
