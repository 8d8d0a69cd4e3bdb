//! Qdrant REST adapter for the vector index seam.
//!
//! Each collection lives in its own Qdrant collection named
//! `{collection_prefix}{collection_id}`. Points carry the chunk in their
//! payload: `document_id`, `chunk_text`, an `offset` (or `chunk_index`) and
//! a flat string `metadata` map that filters match against.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ragway_core::config::VectorIndexConfig;
use ragway_core::domain::collection::{CollectionId, FilterPredicate};
use ragway_core::retrieval::{IndexMatch, RetrievalError, VectorIndex};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::providers::{build_client, endpoint};

pub struct QdrantVectorIndex {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    collection_prefix: String,
}

impl QdrantVectorIndex {
    pub fn from_config(config: &VectorIndexConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config.url.clone(),
            api_key: config.api_key.clone(),
            collection_prefix: config.collection_prefix.clone(),
        })
    }

    fn search_url(&self, collection_id: &CollectionId) -> String {
        endpoint(
            &self.base_url,
            &format!("/collections/{}{}/points/search", self.collection_prefix, collection_id),
        )
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

fn search_body(vector: &[f32], filter: &FilterPredicate, limit: usize) -> Value {
    let mut body = json!({
        "vector": vector,
        "limit": limit,
        "with_payload": true,
        "with_vector": false,
    });
    if !filter.is_empty() {
        let must: Vec<Value> = filter
            .must_match
            .iter()
            .map(|(key, value)| json!({"key": format!("metadata.{key}"), "match": {"value": value}}))
            .collect();
        body["filter"] = json!({"must": must});
    }
    body
}

/// Points without a document id or text are skipped, not fatal.
fn point_match(point: ScoredPoint) -> Option<IndexMatch> {
    let payload = point.payload?;
    let document_id = payload.get("document_id").and_then(scalar_text)?;
    let text = payload.get("chunk_text").and_then(Value::as_str)?.to_owned();
    let offset = payload
        .get("offset")
        .or_else(|| payload.get("chunk_index"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let metadata = payload
        .get("metadata")
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(key, value)| scalar_text(value).map(|text| (key.clone(), text)))
                .collect()
        })
        .unwrap_or_else(BTreeMap::new);
    Some(IndexMatch { document_id, offset, text, score: point.score, metadata })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn search(
        &self,
        collection_id: &CollectionId,
        vector: &[f32],
        filter: &FilterPredicate,
        limit: usize,
    ) -> Result<Vec<IndexMatch>, RetrievalError> {
        let body = search_body(vector, filter, limit);
        let mut request = self.client.post(self.search_url(collection_id)).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            RetrievalError::IndexUnavailable(format!("qdrant request failed: {error}"))
        })?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(RetrievalError::IndexUnavailable(format!(
                    "qdrant has no collection `{}{collection_id}`",
                    self.collection_prefix
                )));
            }
            status => {
                return Err(RetrievalError::IndexUnavailable(format!("qdrant returned {status}")));
            }
        }

        let payload: SearchResponse = response.json().await.map_err(|error| {
            RetrievalError::IndexUnavailable(format!("could not decode qdrant response: {error}"))
        })?;
        let returned = payload.result.len();
        let matches: Vec<IndexMatch> = payload.result.into_iter().filter_map(point_match).collect();
        if matches.len() < returned {
            warn!(
                event_name = "provider.qdrant.malformed_points",
                collection_id = %collection_id,
                skipped = returned - matches.len(),
                "qdrant points without document_id or chunk_text were skipped"
            );
        }
        debug!(
            event_name = "provider.qdrant.searched",
            collection_id = %collection_id,
            match_count = matches.len(),
            "vector search completed"
        );
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ragway_core::config::{VectorIndexConfig, VectorIndexProvider};
    use ragway_core::domain::collection::{CollectionId, FilterPredicate};
    use ragway_core::retrieval::{RetrievalError, VectorIndex};
    use serde_json::json;

    use super::{point_match, search_body, QdrantVectorIndex, SearchResponse};

    fn config(url: &str) -> VectorIndexConfig {
        VectorIndexConfig {
            provider: VectorIndexProvider::Qdrant,
            url: url.to_owned(),
            api_key: None,
            collection_prefix: "knowledge_collection_".to_owned(),
            timeout_secs: 1,
        }
    }

    #[test]
    fn search_targets_the_prefixed_collection() {
        let index = QdrantVectorIndex::from_config(&config("http://qdrant:6333/")).expect("client");
        assert_eq!(
            index.search_url(&CollectionId("handbook".to_owned())),
            "http://qdrant:6333/collections/knowledge_collection_handbook/points/search"
        );
    }

    #[test]
    fn filter_becomes_must_match_on_metadata() {
        let filter = FilterPredicate {
            must_match: BTreeMap::from([("lang".to_owned(), "en".to_owned())]),
        };

        let body = search_body(&[0.5, 0.5], &filter, 3);

        assert_eq!(body["limit"], 3);
        assert_eq!(body["with_payload"], true);
        assert_eq!(
            body["filter"],
            json!({"must": [{"key": "metadata.lang", "match": {"value": "en"}}]})
        );
        assert!(search_body(&[0.5], &FilterPredicate::default(), 3).get("filter").is_none());
    }

    #[test]
    fn scored_points_map_to_index_matches() {
        let response: SearchResponse = serde_json::from_value(json!({
            "status": "ok",
            "time": 0.002,
            "result": [
                {
                    "id": "5b1c",
                    "score": 0.87,
                    "payload": {
                        "document_id": "refund-policy",
                        "chunk_text": "Refunds are issued within 14 days.",
                        "chunk_index": 4,
                        "metadata": {"lang": "en", "page": 2, "tags": ["a"]}
                    }
                },
                {"id": 7, "score": 0.5, "payload": {"chunk_text": "orphan"}},
                {"id": 8, "score": 0.4}
            ]
        }))
        .expect("decode search response");

        let matches: Vec<_> = response.result.into_iter().filter_map(point_match).collect();

        assert_eq!(matches.len(), 1);
        let first = &matches[0];
        assert_eq!(first.document_id, "refund-policy");
        assert_eq!(first.offset, 4);
        assert_eq!(first.text, "Refunds are issued within 14 days.");
        assert!((first.score - 0.87).abs() < f32::EPSILON);
        assert_eq!(first.metadata.get("page").map(String::as_str), Some("2"));
        assert!(!first.metadata.contains_key("tags"));
    }

    #[tokio::test]
    async fn unreachable_qdrant_is_index_unavailable() {
        let index = QdrantVectorIndex::from_config(&config("http://127.0.0.1:9")).expect("client");

        let result = index
            .search(&CollectionId("handbook".to_owned()), &[1.0, 0.0], &FilterPredicate::default(), 3)
            .await;

        assert!(matches!(result, Err(RetrievalError::IndexUnavailable(_))));
    }
}
