//! Retrieval: embed the query, search the collection's vector index, and
//! rank what comes back under the pinned version's policy.

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::chunk::{rank_chunks, RetrievedChunk};
use crate::domain::collection::{CollectionId, CollectionVersion, FilterPredicate};
use crate::errors::ErrorKind;

pub use memory::InMemoryVectorIndex;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("retrieval timed out after {0}ms")]
    Timeout(u64),
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IndexUnavailable(_) | Self::Timeout(_) => ErrorKind::IndexUnavailable,
            Self::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
        }
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexMatch {
    pub document_id: String,
    pub offset: u64,
    pub text: String,
    pub score: f32,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(
        &self,
        collection_id: &CollectionId,
        vector: &[f32],
        filter: &FilterPredicate,
        limit: usize,
    ) -> Result<Vec<IndexMatch>, RetrievalError>;
}

pub struct RetrievalEngine {
    index: Arc<dyn VectorIndex>,
}

impl RetrievalEngine {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }

    /// Top `k` chunks at or above the version's score threshold, ranked by
    /// score with deterministic tie-breaks. `k == 0` never touches the index.
    pub async fn retrieve(
        &self,
        embedding: &[f32],
        version: &CollectionVersion,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let policy = &version.config.retrieval;
        let matches =
            self.index.search(&version.collection_id, embedding, &policy.filter, k).await?;
        let mut chunks: Vec<RetrievedChunk> = matches
            .into_iter()
            .filter(|m| m.score.is_finite() && m.score >= policy.score_threshold)
            .filter(|m| policy.filter.matches(&m.metadata))
            .map(|m| RetrievedChunk {
                document_id: m.document_id,
                offset: m.offset,
                text: m.text,
                score: m.score,
            })
            .collect();
        rank_chunks(&mut chunks);
        chunks.truncate(k);
        Ok(chunks)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrievalPolicy {
    pub timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(5_000), retry_backoff: Duration::from_millis(200) }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalOutcome {
    pub chunks: Vec<RetrievedChunk>,
    pub attempts: u32,
    pub degraded: Option<RetrievalError>,
}

/// Query-to-chunks pipeline with a single bounded retry. A second failure
/// degrades to an empty context rather than failing the request.
pub struct ContextRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    engine: RetrievalEngine,
    policy: RetrievalPolicy,
}

const MAX_ATTEMPTS: u32 = 2;

impl ContextRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        policy: RetrievalPolicy,
    ) -> Self {
        Self { embedder, engine: RetrievalEngine::new(index), policy }
    }

    pub async fn fetch(&self, query: &str, version: &CollectionVersion) -> RetrievalOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(query, version).await {
                Ok(chunks) => {
                    debug!(
                        event_name = "retrieval.fetch.completed",
                        collection_id = %version.collection_id,
                        version_number = version.version_number,
                        chunk_count = chunks.len(),
                        attempts,
                        "retrieved context"
                    );
                    return RetrievalOutcome { chunks, attempts, degraded: None };
                }
                Err(error) if attempts < MAX_ATTEMPTS => {
                    warn!(
                        event_name = "retrieval.fetch.retry",
                        collection_id = %version.collection_id,
                        error = %error,
                        backoff_ms = self.policy.retry_backoff.as_millis() as u64,
                        "retrieval failed, retrying once"
                    );
                    tokio::time::sleep(self.policy.retry_backoff).await;
                }
                Err(error) => {
                    warn!(
                        event_name = "retrieval.fetch.degraded",
                        collection_id = %version.collection_id,
                        error = %error,
                        attempts,
                        "retrieval unavailable, continuing without context"
                    );
                    return RetrievalOutcome { chunks: Vec::new(), attempts, degraded: Some(error) };
                }
            }
        }
    }

    async fn attempt(
        &self,
        query: &str,
        version: &CollectionVersion,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let timeout = self.policy.timeout;
        let work = async {
            let embedding = self.embedder.embed(&version.config.embedding_model, query).await?;
            self.engine.retrieve(&embedding, version, version.config.retrieval.top_k).await
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| RetrievalError::Timeout(timeout.as_millis() as u64))?
    }
}
