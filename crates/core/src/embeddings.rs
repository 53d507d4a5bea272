use crate::error::{PipelineError, ProviderError};
use crate::models::EmbeddingVector;
use crate::traits::EmbeddingProvider;
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Hashed character-trigram embedder. Local, deterministic and always available.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for ch in window {
                let mut buffer = [0u8; 4];
                for byte in ch.encode_utf8(&mut buffer).bytes() {
                    hash ^= byte as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.vectorize(text))
    }
}

/// Embeds one text under a deadline and checks the provider's declared dimension.
pub async fn embed_checked(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<EmbeddingVector, PipelineError> {
    let mut vectors = embed_all_checked(provider, &[text], timeout).await?;
    vectors
        .pop()
        .ok_or_else(|| PipelineError::Embedding("provider returned no vector".to_string()))
}

pub async fn embed_all_checked(
    provider: &dyn EmbeddingProvider,
    texts: &[&str],
    timeout: Duration,
) -> Result<Vec<EmbeddingVector>, PipelineError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let vectors = tokio::time::timeout(timeout, provider.embed_batch(texts))
        .await
        .map_err(|_| PipelineError::Embedding("embedding timeout".to_string()))?
        .map_err(|error| PipelineError::Embedding(error.to_string()))?;

    if vectors.len() != texts.len() {
        return Err(PipelineError::Embedding(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }

    let expected = provider.dimensions();
    vectors
        .into_iter()
        .map(|values| {
            if values.len() != expected {
                return Err(PipelineError::Embedding(format!(
                    "embedding dimension {} != {}",
                    values.len(),
                    expected
                )));
            }
            Ok(EmbeddingVector::new(values))
        })
        .collect()
}
