use std::time::Duration;

use async_trait::async_trait;
use context_core::{ChunkPayload, EngineError, Result, VectorDocument};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{HybridHits, PayloadFilter, ScoredPoint, VectorQuery, VectorStore};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote vector service speaking a qdrant-style REST API. Hybrid
/// collections use named vectors (`content_dense`, `summary_dense`,
/// `sparse`) and server-side reciprocal-rank fusion.
pub struct RemoteVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteVectorStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::config(format!("vector store client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                EngineError::transient(format!("vector store request failed: {e}"))
            } else {
                EngineError::upstream("vector-store", e.to_string())
            }
        })?;
        let status = response.status();
        if status.is_server_error() {
            return Err(EngineError::transient(format!(
                "vector store returned {status}"
            )));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::not_found("collection not found"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::upstream(
                "vector-store",
                format!("{status}: {body}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::upstream("vector-store", format!("bad response body: {e}")))
    }

    fn filter_json(filter: &PayloadFilter) -> Value {
        let mut must = Vec::new();
        if let Some(project_id) = filter.project_id {
            must.push(json!({"key": "project_id", "match": {"value": project_id}}));
        }
        if !filter.dataset_ids.is_empty() {
            must.push(json!({"key": "dataset_id", "match": {"any": filter.dataset_ids}}));
        }
        if let Some(path) = &filter.relative_path {
            must.push(json!({"key": "relative_path", "match": {"value": path}}));
        }
        if let Some(prefix) = &filter.path_prefix {
            must.push(json!({"key": "relative_path", "match": {"prefix": prefix}}));
        }
        if let Some(source_type) = filter.source_type {
            must.push(json!({"key": "source_type", "match": {"value": source_type.as_str()}}));
        }
        if let Some(repo) = &filter.repo {
            must.push(json!({"key": "repo", "match": {"value": repo}}));
        }
        if let Some(lang) = &filter.lang {
            must.push(json!({"key": "lang", "match": {"value": lang}}));
        }
        json!({ "must": must })
    }

    fn point_json(doc: &VectorDocument, hybrid: bool) -> Result<Value> {
        let payload = serde_json::to_value(&doc.payload)
            .map_err(|e| EngineError::upstream("vector-store", format!("payload encode: {e}")))?;
        let vectors = if hybrid {
            let mut named = serde_json::Map::new();
            named.insert("content_dense".to_string(), json!(doc.vector));
            if let Some(summary) = &doc.summary_vector {
                named.insert("summary_dense".to_string(), json!(summary));
            }
            if let Some(sparse) = &doc.sparse {
                named.insert(
                    "sparse".to_string(),
                    json!({"indices": sparse.indices, "values": sparse.values}),
                );
            }
            Value::Object(named)
        } else {
            json!(doc.vector)
        };
        Ok(json!({"id": doc.id, "vector": vectors, "payload": payload}))
    }

    fn parse_hits(result: &Value) -> Result<Vec<ScoredPoint>> {
        let hits = result
            .as_array()
            .or_else(|| result.get("points").and_then(Value::as_array))
            .ok_or_else(|| EngineError::upstream("vector-store", "malformed search result"))?;
        hits.iter()
            .map(|hit| {
                let id: Uuid = serde_json::from_value(hit["id"].clone()).map_err(|e| {
                    EngineError::upstream("vector-store", format!("bad point id: {e}"))
                })?;
                let payload: ChunkPayload = serde_json::from_value(hit["payload"].clone())
                    .map_err(|e| {
                        EngineError::upstream("vector-store", format!("bad payload: {e}"))
                    })?;
                Ok(ScoredPoint {
                    id,
                    score: hit["score"].as_f64().unwrap_or(0.0) as f32,
                    payload,
                })
            })
            .collect()
    }

    /// Whether the collection was created with named vectors. Derived
    /// from the collection info so callers never have to remember.
    async fn is_hybrid_collection(&self, name: &str) -> Result<bool> {
        let info = self
            .send(self.client.get(self.url(&format!("/collections/{name}"))))
            .await?;
        Ok(info["result"]["config"]["params"]["vectors"]
            .get("content_dense")
            .is_some())
    }
}

#[async_trait]
impl VectorStore for RemoteVectorStore {
    fn supports_hybrid(&self) -> bool {
        true
    }

    fn supports_named_vectors(&self) -> bool {
        true
    }

    async fn create_collection(&self, name: &str, dimension: usize, hybrid: bool) -> Result<()> {
        let body = if hybrid {
            json!({
                "vectors": {
                    "content_dense": {"size": dimension, "distance": "Cosine"},
                    "summary_dense": {"size": dimension, "distance": "Cosine"},
                },
                "sparse_vectors": {"sparse": {}},
            })
        } else {
            json!({"vectors": {"size": dimension, "distance": "Cosine"}})
        };
        self.send(
            self.client
                .put(self.url(&format!("/collections/{name}")))
                .json(&body),
        )
        .await?;

        // Payload indexes the search path filters on.
        for field in ["project_id", "dataset_id", "source_type", "relative_path"] {
            self.send(
                self.client
                    .put(self.url(&format!("/collections/{name}/index")))
                    .json(&json!({"field_name": field, "field_schema": "keyword"})),
            )
            .await?;
        }
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        match self
            .send(self.client.delete(self.url(&format!("/collections/{name}"))))
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        match self
            .send(self.client.get(self.url(&format!("/collections/{name}"))))
            .await
        {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let body = self.send(self.client.get(self.url("/collections"))).await?;
        let collections = body["result"]["collections"]
            .as_array()
            .ok_or_else(|| EngineError::upstream("vector-store", "malformed collection list"))?;
        Ok(collections
            .iter()
            .filter_map(|c| c["name"].as_str().map(str::to_string))
            .collect())
    }

    async fn count(&self, name: &str) -> Result<u64> {
        let body = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/count")))
                    .json(&json!({"exact": true})),
            )
            .await?;
        Ok(body["result"]["count"].as_u64().unwrap_or(0))
    }

    async fn upsert(&self, name: &str, documents: Vec<VectorDocument>) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let hybrid = self.is_hybrid_collection(name).await?;
        let points = documents
            .iter()
            .map(|doc| Self::point_json(doc, hybrid))
            .collect::<Result<Vec<_>>>()?;
        self.send(
            self.client
                .put(self.url(&format!("/collections/{name}/points?wait=true")))
                .json(&json!({"points": points})),
        )
        .await?;
        Ok(())
    }

    async fn delete_by_ids(&self, name: &str, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.send(
            self.client
                .post(self.url(&format!("/collections/{name}/points/delete?wait=true")))
                .json(&json!({"points": ids})),
        )
        .await?;
        Ok(())
    }

    async fn delete_by_filter(&self, name: &str, filter: &PayloadFilter) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!("/collections/{name}/points/delete?wait=true")))
                .json(&json!({"filter": Self::filter_json(filter)})),
        )
        .await?;
        Ok(())
    }

    async fn update_relative_path(
        &self,
        name: &str,
        filter: &PayloadFilter,
        new_path: &str,
    ) -> Result<()> {
        self.send(
            self.client
                .post(self.url(&format!("/collections/{name}/points/payload?wait=true")))
                .json(&json!({
                    "payload": {"relative_path": new_path},
                    "filter": Self::filter_json(filter),
                })),
        )
        .await?;
        Ok(())
    }

    async fn search(&self, name: &str, query: &VectorQuery) -> Result<Vec<ScoredPoint>> {
        let hybrid = self.is_hybrid_collection(name).await?;
        let vector = if hybrid {
            json!({"name": "content_dense", "vector": query.vector})
        } else {
            json!(query.vector)
        };
        let body = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/search")))
                    .json(&json!({
                        "vector": vector,
                        "filter": Self::filter_json(&query.filter),
                        "limit": query.limit,
                        "with_payload": true,
                    })),
            )
            .await?;
        Self::parse_hits(&body["result"])
    }

    async fn hybrid_search(&self, name: &str, query: &VectorQuery) -> Result<HybridHits> {
        let Some(sparse) = &query.sparse else {
            return Ok(HybridHits::Fused(self.search(name, query).await?));
        };
        let body = self
            .send(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/query")))
                    .json(&json!({
                        "prefetch": [
                            {
                                "query": query.vector,
                                "using": "content_dense",
                                "limit": query.limit,
                            },
                            {
                                "query": {"indices": sparse.indices, "values": sparse.values},
                                "using": "sparse",
                                "limit": query.limit,
                            },
                        ],
                        "query": {"fusion": "rrf"},
                        "filter": Self::filter_json(&query.filter),
                        "limit": query.limit,
                        "with_payload": true,
                    })),
            )
            .await?;
        Ok(HybridHits::Fused(Self::parse_hits(&body["result"])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_core::SourceType;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_payload() -> Value {
        json!({
            "content": "fn main() {}",
            "relative_path": "src/main.rs",
            "start_line": 1,
            "end_line": 1,
            "file_extension": "rs",
            "project_id": Uuid::new_v4(),
            "dataset_id": Uuid::new_v4(),
            "source_type": "git",
            "metadata": null,
        })
    }

    #[tokio::test]
    async fn search_parses_hits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/c"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"config": {"params": {"vectors": {"size": 2, "distance": "Cosine"}}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/c/points/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"id": Uuid::new_v4(), "score": 0.93, "payload": sample_payload()}]
            })))
            .mount(&server)
            .await;

        let store = RemoteVectorStore::new(server.uri()).unwrap();
        let hits = store
            .search(
                "c",
                &VectorQuery {
                    vector: vec![1.0, 0.0],
                    sparse: None,
                    text: None,
                    limit: 5,
                    filter: PayloadFilter::default(),
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.93).abs() < 1e-6);
        assert_eq!(hits[0].payload.source_type, SourceType::Git);
    }

    #[tokio::test]
    async fn filters_serialize_as_must_clauses() {
        let project = Uuid::new_v4();
        let dataset = Uuid::new_v4();
        let filter = PayloadFilter {
            project_id: Some(project),
            dataset_ids: vec![dataset],
            lang: Some("rust".to_string()),
            ..PayloadFilter::default()
        };
        let value = RemoteVectorStore::filter_json(&filter);
        let must = value["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[0]["key"], "project_id");
        assert_eq!(must[1]["match"]["any"][0], json!(dataset));
    }

    #[tokio::test]
    async fn missing_collection_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = RemoteVectorStore::new(server.uri()).unwrap();
        assert!(!store.has_collection("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_by_filter_posts_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/c/points/delete"))
            .and(body_partial_json(json!({"filter": {"must": [
                {"key": "relative_path", "match": {"value": "src/old.rs"}}
            ]}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})))
            .mount(&server)
            .await;

        let store = RemoteVectorStore::new(server.uri()).unwrap();
        let filter = PayloadFilter {
            relative_path: Some("src/old.rs".to_string()),
            ..PayloadFilter::default()
        };
        store.delete_by_filter("c", &filter).await.unwrap();
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = RemoteVectorStore::new(server.uri()).unwrap();
        let err = store.list_collections().await.unwrap_err();
        assert!(err.is_transient());
    }
}
