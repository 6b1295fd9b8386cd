use std::time::Duration;

use async_trait::async_trait;
use context_core::{EngineError, Result};
use serde::{Deserialize, Serialize};

use crate::Embedder;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BATCH: usize = 64;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP embedding provider speaking the `POST {base}/api/embed` batch
/// protocol. Large inputs are split into bounded batches so one oversized
/// sync cannot produce an unbounded request body.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl RemoteEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::config(format!("embedder client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    async fn embed_one_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    EngineError::transient(format!("embedder request failed: {e}"))
                } else {
                    EngineError::upstream("embedder", e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EngineError::transient(format!("embedder returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::upstream(
                "embedder",
                format!("{status}: {body}"),
            ));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EngineError::upstream("embedder", format!("bad response body: {e}")))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EngineError::upstream(
                "embedder",
                format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            ));
        }
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            out.extend(self.embed_one_batch(batch).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn embeds_a_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2], [0.3, 0.4]]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(server.uri(), "test-model").unwrap();
        let vectors = embedder
            .embed_batch(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn dimension_discovery_uses_probe() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.0, 0.0, 0.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(server.uri(), "test-model").unwrap();
        assert_eq!(embedder.dimension().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(server.uri(), "test-model").unwrap();
        let err = embedder.embed("x").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn mismatched_count_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1]]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(server.uri(), "test-model").unwrap();
        let err = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Upstream { .. }));
    }
}
