use async_trait::async_trait;
use context_core::Result;
use sha2::{Digest, Sha256};

use crate::Embedder;

/// Deterministic embedder used by engine-level tests and local smoke
/// runs: the vector is derived from a SHA-256 of the text, so equal
/// inputs always embed identically and similar texts do not.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(8)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let digest = Sha256::digest(text.as_bytes());
                (0..self.dimension)
                    .map(|i| {
                        let byte = digest[i % digest.len()];
                        (byte as f32 / 255.0) * 2.0 - 1.0
                    })
                    .collect()
            })
            .collect())
    }
}
