use crate::error::PipelineError;
use crate::models::RetrievalResult;
use crate::schema::AnswerSchema;
use crate::traits::GenerationProvider;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const ANSWER_INSTRUCTIONS: &str = "Use the following pieces of context taken from a web page to \
answer the question at the end. Answer only from this context. If the context does not contain \
the answer, say that the page does not provide it; do not make up an answer.";

/// Unvalidated provider output, kept for the `raw` field of the result.
#[derive(Debug, Clone, Serialize)]
pub struct RawAnswer {
    pub provider: String,
    pub question: String,
    pub text: String,
}

impl RawAnswer {
    pub fn payload(&self) -> Value {
        json!({
            "query": self.question,
            "result": self.text,
            "provider": self.provider,
        })
    }
}

#[derive(Clone)]
pub struct AnswerSynthesizer {
    provider: Option<Arc<dyn GenerationProvider>>,
    schema: AnswerSchema,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(
        provider: Option<Arc<dyn GenerationProvider>>,
        schema: AnswerSchema,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            schema,
            timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub fn build_prompt(&self, question: &str, retrieved: &RetrievalResult) -> String {
        let context = retrieved
            .hits
            .iter()
            .enumerate()
            .map(|(rank, hit)| {
                format!(
                    "[{}] (chunk {})\n{}",
                    rank + 1,
                    hit.chunk.id,
                    hit.chunk.text.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "{ANSWER_INSTRUCTIONS}\n\nContext:\n{context}\n\nQuestion: {}\n\n{}",
            question.trim(),
            self.schema.format_instructions()
        )
    }

    pub async fn synthesize(
        &self,
        question: &str,
        retrieved: &RetrievalResult,
    ) -> Result<RawAnswer, PipelineError> {
        let provider = self.provider.as_deref().ok_or_else(|| {
            PipelineError::LlmUnavailable("no generation provider is configured".to_string())
        })?;

        let prompt = self.build_prompt(question, retrieved);
        debug!(
            provider = provider.name(),
            prompt_chars = prompt.len(),
            context_chunks = retrieved.len(),
            "invoking generation provider"
        );

        let text = generate_with_timeout(provider, &prompt, self.timeout).await?;
        Ok(RawAnswer {
            provider: provider.name().to_string(),
            question: question.to_string(),
            text,
        })
    }
}

/// Single generation call under a deadline; every failure is an invocation error.
pub async fn generate_with_timeout(
    provider: &dyn GenerationProvider,
    prompt: &str,
    timeout: Duration,
) -> Result<String, PipelineError> {
    tokio::time::timeout(timeout, provider.generate(prompt))
        .await
        .map_err(|_| {
            PipelineError::LlmInvocation(format!("{} timed out after {timeout:?}", provider.name()))
        })?
        .map_err(|error| PipelineError::LlmInvocation(format!("{}: {error}", provider.name())))
}
