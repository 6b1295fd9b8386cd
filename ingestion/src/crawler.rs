use std::time::Duration;

use context_core::{EngineError, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlRequest {
    pub start_url: String,
    pub project: String,
    pub dataset: String,
    pub crawl_type: String,
    pub max_pages: u32,
    pub depth: u32,
    pub scope: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlStarted {
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlProgress {
    pub phase: String,
    pub percentage: f32,
    pub current: u32,
    pub total: u32,
    pub status: String,
    pub chunks_total: u32,
    pub chunks_processed: u32,
    pub summaries_generated: u32,
    pub embeddings_generated: u32,
    pub phase_detail: Option<String>,
}

impl CrawlProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed" | "cancelled")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawledPage {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlPageBatch {
    pub pages: Vec<CrawledPage>,
    pub total: u32,
}

/// HTTP client for the external crawler service. The engine only ever
/// starts crawls, polls progress, and drains crawled pages.
pub struct CrawlerClient {
    client: reqwest::Client,
    base_url: String,
}

impl CrawlerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::config(format!("crawler client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn start_crawl(&self, request: &CrawlRequest) -> Result<CrawlStarted> {
        let response = self
            .client
            .post(format!("{}/crawl", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(transport_err)?;
        decode(response, "crawler").await
    }

    pub async fn progress(&self, session_id: &str) -> Result<CrawlProgress> {
        let response = self
            .client
            .get(format!("{}/progress/{session_id}", self.base_url))
            .send()
            .await
            .map_err(transport_err)?;
        decode(response, "crawler").await
    }

    /// Pages crawled so far, starting at `offset`. Workers drain this
    /// incrementally so large crawls stream page-by-page.
    pub async fn pages(&self, session_id: &str, offset: u32) -> Result<CrawlPageBatch> {
        let response = self
            .client
            .get(format!(
                "{}/pages/{session_id}?offset={offset}",
                self.base_url
            ))
            .send()
            .await
            .map_err(transport_err)?;
        decode(response, "crawler").await
    }
}

fn transport_err(e: reqwest::Error) -> EngineError {
    if e.is_timeout() || e.is_connect() {
        EngineError::transient(format!("crawler request failed: {e}"))
    } else {
        EngineError::upstream("crawler", e.to_string())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    service: &str,
) -> Result<T> {
    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(EngineError::not_found("crawl session unknown"));
    }
    if status.is_server_error() {
        return Err(EngineError::transient(format!("{service} returned {status}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EngineError::upstream(service, format!("{status}: {body}")));
    }
    response
        .json()
        .await
        .map_err(|e| EngineError::upstream(service, format!("bad response body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn starts_a_crawl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crawl"))
            .and(body_partial_json(serde_json::json!({
                "startUrl": "https://docs.example.com",
                "project": "alpha",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sessionId": "cs-42", "status": "running"
            })))
            .mount(&server)
            .await;

        let client = CrawlerClient::new(server.uri()).unwrap();
        let started = client
            .start_crawl(&CrawlRequest {
                start_url: "https://docs.example.com".to_string(),
                project: "alpha".to_string(),
                dataset: "docs".to_string(),
                crawl_type: "site".to_string(),
                max_pages: 100,
                depth: 3,
                scope: "domain".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(started.session_id, "cs-42");
    }

    #[tokio::test]
    async fn reads_progress_and_terminal_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/progress/cs-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "phase": "embedding",
                "percentage": 80.0,
                "current": 40,
                "total": 50,
                "status": "completed",
                "chunksTotal": 500,
                "chunksProcessed": 500,
                "summariesGenerated": 50,
                "embeddingsGenerated": 500,
                "phaseDetail": "embedding page 40/50"
            })))
            .mount(&server)
            .await;

        let client = CrawlerClient::new(server.uri()).unwrap();
        let progress = client.progress("cs-42").await.unwrap();
        assert_eq!(progress.chunks_total, 500);
        assert!(progress.is_terminal());
    }

    #[tokio::test]
    async fn pages_are_offset_paged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pages/cs-42"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "pages": [{"url": "https://a/b", "title": "B", "content": "body"}],
                "total": 3
            })))
            .mount(&server)
            .await;

        let client = CrawlerClient::new(server.uri()).unwrap();
        let batch = client.pages("cs-42", 2).await.unwrap();
        assert_eq!(batch.pages.len(), 1);
        assert_eq!(batch.total, 3);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/progress/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = CrawlerClient::new(server.uri()).unwrap();
        let err = client.progress("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
