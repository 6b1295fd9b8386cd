use async_trait::async_trait;
use context_core::{Result, SparseVector};

pub mod chunker;
pub mod mock;
pub mod remote;
pub mod sparse;

pub use chunker::{LineChunker, TextChunk};
pub use mock::MockEmbedder;
pub use remote::RemoteEmbedder;
pub use sparse::HashedSparseEncoder;

/// Dense embedding provider. The model behind it is opaque; the engine
/// only ever sees vectors and a dimension, which is discovered once and
/// recorded on the dataset's collection row.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            context_core::EngineError::upstream("embedder", "empty embedding batch response")
        })
    }

    /// Discover the output dimension by embedding a probe string.
    async fn dimension(&self) -> Result<usize> {
        Ok(self.embed("dimension probe").await?.len())
    }
}

/// Optional sparse/lexical encoder used when hybrid search is enabled.
pub trait SparseEncoder: Send + Sync {
    fn encode(&self, text: &str) -> SparseVector;
}

/// Splits one file into ordered chunks. Syntax-aware splitting lives
/// behind this trait; the engine only relies on ordering and line spans.
pub trait Chunker: Send + Sync {
    fn chunk(&self, relative_path: &str, content: &str) -> Vec<TextChunk>;
}
