use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::collection::{CollectionId, FilterPredicate};
use crate::retrieval::{IndexMatch, RetrievalError, VectorIndex};

#[derive(Clone, Debug, PartialEq)]
pub struct IndexedChunk {
    pub document_id: String,
    pub offset: u64,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

/// Brute-force cosine index held in process memory.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    collections: RwLock<HashMap<CollectionId, Vec<IndexedChunk>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a chunk, replacing any existing chunk at the same document offset.
    pub async fn upsert(&self, collection_id: CollectionId, chunk: IndexedChunk) {
        let mut collections = self.collections.write().await;
        let chunks = collections.entry(collection_id).or_default();
        chunks.retain(|existing| {
            !(existing.document_id == chunk.document_id && existing.offset == chunk.offset)
        });
        chunks.push(chunk);
    }

    pub async fn len(&self, collection_id: &CollectionId) -> usize {
        self.collections.read().await.get(collection_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn search(
        &self,
        collection_id: &CollectionId,
        vector: &[f32],
        filter: &FilterPredicate,
        limit: usize,
    ) -> Result<Vec<IndexMatch>, RetrievalError> {
        let collections = self.collections.read().await;
        let Some(chunks) = collections.get(collection_id) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<IndexMatch> = chunks
            .iter()
            .filter(|chunk| filter.matches(&chunk.metadata))
            .map(|chunk| IndexMatch {
                document_id: chunk.document_id.clone(),
                offset: chunk.offset,
                text: chunk.text.clone(),
                score: cosine_similarity(vector, &chunk.embedding),
                metadata: chunk.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then_with(|| a.offset.cmp(&b.offset))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

/// Cosine similarity clamped to `[0, 1]`; mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::domain::collection::{CollectionId, FilterPredicate};
    use crate::retrieval::VectorIndex;

    use super::{cosine_similarity, InMemoryVectorIndex, IndexedChunk};

    fn chunk(document_id: &str, embedding: Vec<f32>, lang: &str) -> IndexedChunk {
        IndexedChunk {
            document_id: document_id.to_owned(),
            offset: 0,
            text: document_id.to_owned(),
            embedding,
            metadata: BTreeMap::from([("lang".to_owned(), lang.to_owned())]),
        }
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_applies_filter_and_limit() {
        let index = InMemoryVectorIndex::new();
        let kb = CollectionId("kb".to_owned());
        index.upsert(kb.clone(), chunk("near-en", vec![1.0, 0.1], "en")).await;
        index.upsert(kb.clone(), chunk("far-en", vec![0.2, 1.0], "en")).await;
        index.upsert(kb.clone(), chunk("near-de", vec![1.0, 0.0], "de")).await;
        index.upsert(kb.clone(), chunk("near-en", vec![1.0, 0.0], "en")).await;

        let filter = FilterPredicate {
            must_match: BTreeMap::from([("lang".to_owned(), "en".to_owned())]),
        };
        let matches = index.search(&kb, &[1.0, 0.0], &filter, 1).await.expect("search");

        assert_eq!(index.len(&kb).await, 3);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].document_id, "near-en");
        assert_eq!(matches[0].score, 1.0);
    }

    #[tokio::test]
    async fn search_on_unknown_collection_is_empty() {
        let index = InMemoryVectorIndex::new();
        let matches = index
            .search(&CollectionId("none".to_owned()), &[1.0], &FilterPredicate::default(), 5)
            .await
            .expect("search");
        assert!(matches.is_empty());
    }
}
