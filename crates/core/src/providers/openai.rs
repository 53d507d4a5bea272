//! OpenAI-compatible embeddings and chat-completions clients.

use super::ensure_success;
use crate::error::ProviderError;
use crate::traits::{EmbeddingProvider, GenerationProvider};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER: &str = "openai";

/// Inputs per embeddings request.
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 128;

/// Hard cap on inputs per embeddings request.
const MAX_EMBEDDING_BATCH_SIZE: usize = 2_048;

const SYSTEM_PROMPT: &str = "You answer questions about a single web page using only the \
    context you are given, and you follow the requested output format exactly.";

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ProviderError::Http)
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

fn require(value: &str, what: &str) -> Result<String, ProviderError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ProviderError::Misconfigured(format!("missing OpenAI {what}")));
    }
    Ok(trimmed.to_string())
}

/// Embeddings over `POST {base}/embeddings`, with the output dimension pinned.
#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if dimensions == 0 {
            return Err(ProviderError::Misconfigured(
                "embedding dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint(base_url, "embeddings"),
            api_key: require(api_key, "API key")?,
            model: require(model, "embedding model")?,
            dimensions,
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
        })
    }

    /// Clamped to `1..=2048`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_EMBEDDING_BATCH_SIZE);
        self
    }

    async fn embed_request(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let mut parsed: EmbeddingResponse = ensure_success(PROVIDER, response).await?.json().await?;

        parsed.data.sort_by_key(|entry| entry.index);
        let in_order = parsed.data.len() == texts.len()
            && parsed
                .data
                .iter()
                .enumerate()
                .all(|(position, entry)| entry.index == position);
        if !in_order {
            return Err(ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                details: format!(
                    "{} embeddings for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
            });
        }

        Ok(parsed
            .data
            .into_iter()
            .map(|entry| entry.embedding)
            .collect())
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text]).await?;
        vectors.pop().ok_or_else(|| ProviderError::InvalidResponse {
            provider: PROVIDER.to_string(),
            details: "no embedding returned".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            vectors.extend(self.embed_request(batch).await?);
        }
        Ok(vectors)
    }
}

/// Generation over `POST {base}/chat/completions`.
#[derive(Clone)]
pub struct OpenAiChatProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiChatProvider {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint(base_url, "chat/completions"),
            api_key: require(api_key, "API key")?,
            model: require(model, "chat model")?,
            temperature: 0.0,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl GenerationProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let parsed: ChatResponse = ensure_success(PROVIDER, response).await?.json().await?;

        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: PROVIDER.to_string(),
                details: "completion had no content".to_string(),
            })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{http_response, serve_once, serve_sequence};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let error = OpenAiChatProvider::new("  ", "https://api.openai.com/v1", "gpt-4o-mini", TIMEOUT)
            .err()
            .expect("blank key must be rejected");
        assert!(matches!(error, ProviderError::Misconfigured(_)));
    }

    #[tokio::test]
    async fn embeddings_are_returned_in_input_order() {
        let base = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
        ))
        .await;

        let provider = OpenAiEmbeddingProvider::new("key", &base, "text-embedding-3-small", 2, TIMEOUT)
            .unwrap();
        let vectors = provider.embed_batch(&["first", "second"]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn large_inputs_are_split_into_ordered_batches() {
        let base = serve_sequence(vec![
            http_response(
                "200 OK",
                "application/json",
                r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#,
            )
            .into_bytes(),
            http_response(
                "200 OK",
                "application/json",
                r#"{"data":[{"index":0,"embedding":[0.5,0.5]}]}"#,
            )
            .into_bytes(),
        ])
        .await;

        let provider = OpenAiEmbeddingProvider::new("key", &base, "text-embedding-3-small", 2, TIMEOUT)
            .unwrap()
            .with_batch_size(2);
        let vectors = provider
            .embed_batch(&["first", "second", "third"])
            .await
            .unwrap();
        assert_eq!(
            vectors,
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]]
        );
    }

    #[tokio::test]
    async fn duplicate_indices_are_rejected() {
        let base = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"data":[{"index":0,"embedding":[1.0,0.0]},{"index":0,"embedding":[0.0,1.0]}]}"#,
        ))
        .await;

        let provider = OpenAiEmbeddingProvider::new("key", &base, "text-embedding-3-small", 2, TIMEOUT)
            .unwrap();
        let error = provider.embed_batch(&["first", "second"]).await.unwrap_err();
        assert!(matches!(error, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn chat_completion_content_is_returned() {
        let base = serve_once(http_response(
            "200 OK",
            "application/json",
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"summary\":\"green\"}"}}]}"#,
        ))
        .await;

        let provider = OpenAiChatProvider::new("key", &base, "gpt-4o-mini", TIMEOUT).unwrap();
        let text = provider.generate("What color is grass?").await.unwrap();
        assert_eq!(text, r#"{"summary":"green"}"#);
    }

    #[tokio::test]
    async fn error_status_keeps_the_body() {
        let base = serve_once(http_response(
            "429 Too Many Requests",
            "application/json",
            r#"{"error":"rate limited"}"#,
        ))
        .await;

        let provider = OpenAiChatProvider::new("key", &base, "gpt-4o-mini", TIMEOUT).unwrap();
        let error = provider.generate("hi").await.unwrap_err();
        assert!(matches!(
            error,
            ProviderError::Status { status: 429, ref body, .. } if body.contains("rate limited")
        ));
    }
}
