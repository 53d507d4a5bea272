use crate::embeddings::embed_checked;
use crate::error::PipelineError;
use crate::index::VectorIndex;
use crate::models::{RetrievalResult, DEFAULT_TOP_K};
use crate::traits::EmbeddingProvider;
use std::sync::Arc;
use std::time::Duration;

/// Embeds the question with the same provider that built the index and ranks chunks.
#[derive(Clone)]
pub struct Retriever {
    provider: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    top_k: usize,
}

impl Retriever {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn retrieve(
        &self,
        index: &VectorIndex,
        question: &str,
    ) -> Result<RetrievalResult, PipelineError> {
        let question_vector = embed_checked(self.provider.as_ref(), question, self.timeout).await?;
        index.query(&question_vector, self.top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::split;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{Chunk, SourceDocument};

    #[tokio::test]
    async fn retrieves_at_most_top_k_chunks() {
        let text = "Rust has ownership. Go has garbage collection. Zig has comptime. \
                    C has pointers. Python has indentation.";
        let document = SourceDocument::new("https://example.com/langs", text);
        let chunks: Vec<Chunk> = split(&document, 24, 4).unwrap();
        let chunk_count = chunks.len();
        assert!(chunk_count > 2);

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(CharacterNgramEmbedder::default());
        let timeout = Duration::from_secs(1);
        let index = VectorIndex::build(chunks, provider.as_ref(), timeout)
            .await
            .unwrap();

        let retriever = Retriever::new(provider.clone(), timeout).with_top_k(2);
        let result = retriever.retrieve(&index, "Which language has comptime?").await.unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.hits[0].chunk.text.contains("comptime"));

        let retriever = Retriever::new(provider, timeout).with_top_k(50);
        let result = retriever.retrieve(&index, "pointers").await.unwrap();
        assert_eq!(result.len(), chunk_count);
    }
}
