pub mod gemini;
pub mod openai;

pub use gemini::GeminiProvider;
pub use openai::{OpenAiChatProvider, OpenAiEmbeddingProvider};

use crate::error::ProviderError;
use reqwest::Response;

/// Turns a non-success response into [`ProviderError::Status`], keeping the body for diagnosis.
pub(crate) async fn ensure_success(
    provider: &str,
    response: Response,
) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(ProviderError::Status {
        provider: provider.to_string(),
        status: status.as_u16(),
        body,
    })
}
