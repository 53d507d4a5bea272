//! Request-scoped, in-memory vector index.
//!
//! Entries live in a flat arena whose position equals the chunk id, so the index
//! owns everything it ranks and nothing outlives the run that built it.

use crate::embeddings::embed_all_checked;
use crate::error::PipelineError;
use crate::models::{Chunk, EmbeddingVector, RetrievalResult, ScoredChunk};
use crate::traits::EmbeddingProvider;
use std::cmp::Ordering;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: EmbeddingVector,
}

#[derive(Debug)]
pub struct VectorIndex {
    dimensions: usize,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    /// Embeds every chunk with `provider` and stores the results.
    pub async fn build(
        chunks: Vec<Chunk>,
        provider: &dyn EmbeddingProvider,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        let texts = chunks.iter().map(|chunk| chunk.text.as_str()).collect::<Vec<_>>();
        let vectors = embed_all_checked(provider, &texts, timeout).await?;
        debug!(chunks = chunks.len(), dimensions = provider.dimensions(), "embedded chunks");

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| IndexEntry { chunk, vector })
            .collect();
        Self::from_entries(provider.dimensions(), entries)
    }

    pub fn from_entries(
        dimensions: usize,
        entries: Vec<IndexEntry>,
    ) -> Result<Self, PipelineError> {
        for (position, entry) in entries.iter().enumerate() {
            if entry.chunk.id != position {
                return Err(PipelineError::Embedding(format!(
                    "chunk id {} stored at position {position}",
                    entry.chunk.id
                )));
            }
            if entry.vector.dimensions() != dimensions {
                return Err(PipelineError::Embedding(format!(
                    "embedding dimension {} != {} for chunk {}",
                    entry.vector.dimensions(),
                    dimensions,
                    entry.chunk.id
                )));
            }
        }
        Ok(Self {
            dimensions,
            entries,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, chunk_id: usize) -> Option<&IndexEntry> {
        self.entries.get(chunk_id)
    }

    /// Ranks chunks by cosine similarity to `question`, best first.
    ///
    /// Equal scores keep source order. `k` is clamped to the number of entries.
    pub fn query(
        &self,
        question: &EmbeddingVector,
        k: usize,
    ) -> Result<RetrievalResult, PipelineError> {
        if question.dimensions() != self.dimensions {
            return Err(PipelineError::Embedding(format!(
                "question embedding dimension {} != {}",
                question.dimensions(),
                self.dimensions
            )));
        }

        let mut scored = self
            .entries
            .iter()
            .map(|entry| (entry.chunk.id, cosine_similarity(question, &entry.vector)))
            .collect::<Vec<_>>();

        scored.sort_by(|left, right| rank_order(*left, *right));
        scored.truncate(k.min(self.entries.len()));

        Ok(RetrievalResult {
            hits: scored
                .into_iter()
                .map(|(id, score)| ScoredChunk {
                    chunk: self.entries[id].chunk.clone(),
                    score,
                })
                .collect(),
        })
    }
}

fn rank_order(left: (usize, f32), right: (usize, f32)) -> Ordering {
    right
        .1
        .total_cmp(&left.1)
        .then_with(|| left.0.cmp(&right.0))
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(left: &EmbeddingVector, right: &EmbeddingVector) -> f32 {
    let denominator = left.magnitude() * right.magnitude();
    if denominator == 0.0 {
        return 0.0;
    }

    let dot = left
        .as_slice()
        .iter()
        .zip(right.as_slice())
        .map(|(a, b)| a * b)
        .sum::<f32>();
    let similarity = dot / denominator;
    if similarity.is_nan() {
        0.0
    } else {
        similarity
    }
}
