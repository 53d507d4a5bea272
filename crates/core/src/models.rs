use crate::error::PipelineError;
use crate::schema::{AnswerSchema, StructuredAnswer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub url: String,
    pub raw_text: String,
    pub fetched_at: DateTime<Utc>,
}

impl SourceDocument {
    pub fn new(url: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            raw_text: raw_text.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// A contiguous slice of a [`SourceDocument`]; `start_offset` counts characters, not bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: usize,
    pub text: String,
    pub source_url: String,
    pub start_offset: usize,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn end_offset(&self) -> usize {
        self.start_offset + self.char_len()
    }
}

/// Fixed-dimension embedding; values cannot change after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector(Box<[f32]>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values.into_boxed_slice())
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn magnitude(&self) -> f32 {
        self.0.iter().map(|value| value * value).sum::<f32>().sqrt()
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<usize> {
        self.hits.iter().map(|hit| hit.chunk.id).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub url: String,
    pub question: String,
}

impl QueryRequest {
    pub fn new(url: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            question: question.into(),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.url.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("missing 'url'".to_string()));
        }
        if self.question.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "missing 'question'".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    Loaded,
    Chunked,
    Indexed,
    Retrieved,
    Synthesized,
    Validated,
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Received => "received",
            Self::Loaded => "loaded",
            Self::Chunked => "chunked",
            Self::Indexed => "indexed",
            Self::Retrieved => "retrieved",
            Self::Synthesized => "synthesized",
            Self::Validated => "validated",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Where and how a run failed. Not part of the wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Failure {
    pub stage: PipelineStage,
    pub status: u16,
}

/// Terminal artifact of one pipeline run.
///
/// Built only through [`QueryResult::success`] or [`QueryResult::failure`], so
/// either `answer`, `raw` and `structured` are all set, or only `error` is.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    answer: Option<String>,
    raw: Option<Value>,
    structured: Option<StructuredAnswer>,
    error: Option<String>,
    #[serde(skip)]
    failure: Option<Failure>,
}

impl QueryResult {
    pub fn success(answer: String, raw: Value, structured: StructuredAnswer) -> Self {
        Self {
            answer: Some(answer),
            raw: Some(raw),
            structured: Some(structured),
            error: None,
            failure: None,
        }
    }

    pub fn failure(stage: PipelineStage, error: &PipelineError) -> Self {
        Self {
            answer: None,
            raw: None,
            structured: None,
            error: Some(error.to_string()),
            failure: Some(Failure {
                stage,
                status: error.status_code(),
            }),
        }
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn raw(&self) -> Option<&Value> {
        self.raw.as_ref()
    }

    pub fn structured(&self) -> Option<&StructuredAnswer> {
        self.structured.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn failure_info(&self) -> Option<Failure> {
        self.failure
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status_code(&self) -> u16 {
        self.failure.map(|failure| failure.status).unwrap_or(200)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Readiness {
    pub llm_initialized: bool,
    pub embeddings_initialized: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    /// Look-back window for soft chunk boundaries; `None` uses a quarter of `chunk_max_chars`.
    pub chunk_boundary_window: Option<usize>,
    pub top_k: usize,
    pub fetch_timeout: Duration,
    pub embed_timeout: Duration,
    pub generate_timeout: Duration,
    pub llm_max_retries: usize,
    pub retry_backoff: Duration,
    pub schema: AnswerSchema,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_max_chars: 2_000,
            chunk_overlap_chars: 200,
            chunk_boundary_window: None,
            top_k: DEFAULT_TOP_K,
            fetch_timeout: Duration::from_secs(20),
            embed_timeout: Duration::from_secs(30),
            generate_timeout: Duration::from_secs(60),
            llm_max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            schema: AnswerSchema::default(),
        }
    }
}

pub const DEFAULT_TOP_K: usize = 4;

impl PipelineOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_max_chars == 0 {
            return Err(PipelineError::Config(
                "chunk_max_chars must be greater than zero".to_string(),
            ));
        }
        if self.chunk_overlap_chars >= self.chunk_max_chars {
            return Err(PipelineError::Config(format!(
                "chunk_overlap_chars ({}) must be less than chunk_max_chars ({})",
                self.chunk_overlap_chars, self.chunk_max_chars
            )));
        }
        if self.top_k == 0 {
            return Err(PipelineError::Config(
                "top_k must be greater than zero".to_string(),
            ));
        }
        self.schema.validate_definition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_valid() {
        PipelineOptions::default()
            .validate()
            .expect("defaults should validate");
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let options = PipelineOptions {
            chunk_max_chars: 100,
            chunk_overlap_chars: 100,
            ..PipelineOptions::default()
        };
        assert!(matches!(options.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn blank_question_is_rejected() {
        let request = QueryRequest::new("https://example.com", "   ");
        let error = request.validate().unwrap_err();
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn failure_result_only_carries_error() {
        let error = PipelineError::Fetch(crate::error::FetchError::Timeout);
        let result = QueryResult::failure(PipelineStage::Loaded, &error);

        assert_eq!(result.error(), Some("fetch timeout"));
        assert!(result.answer().is_none());
        assert!(result.raw().is_none());
        assert!(result.structured().is_none());
        assert_eq!(result.status_code(), 504);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "answer": null,
                "raw": null,
                "structured": null,
                "error": "fetch timeout",
            })
        );
    }
}
