use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

const EXCERPT_CHARS: usize = 200;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub document_id: String,
    pub offset: u64,
    pub text: String,
    pub score: f32,
}

impl RetrievedChunk {
    /// Score descending, then document id ascending, then offset ascending.
    pub fn ranking_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.document_id.cmp(&other.document_id))
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

pub fn rank_chunks(chunks: &mut [RetrievedChunk]) {
    chunks.sort_by(RetrievedChunk::ranking_cmp);
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub rank: usize,
    pub document_id: String,
    pub offset: u64,
    pub score: f32,
    pub excerpt: String,
}

impl SourceAttribution {
    pub fn from_ranked(chunks: &[RetrievedChunk]) -> Vec<Self> {
        chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| Self {
                rank: index + 1,
                document_id: chunk.document_id.clone(),
                offset: chunk.offset,
                score: chunk.score,
                excerpt: excerpt(&chunk.text),
            })
            .collect()
    }
}

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_owned(),
    }
}
