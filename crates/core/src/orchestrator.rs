use crate::chunking::{split_with, ChunkingConfig};
use crate::error::{FetchError, PipelineError};
use crate::index::VectorIndex;
use crate::models::{
    Chunk, PipelineOptions, PipelineStage, QueryRequest, QueryResult, Readiness, RetrievalResult,
    SourceDocument,
};
use crate::retriever::Retriever;
use crate::schema::StructuredAnswer;
use crate::synthesizer::{AnswerSynthesizer, RawAnswer};
use crate::traits::{DocumentLoader, EmbeddingProvider, GenerationProvider};
use crate::validator::StructuredOutputValidator;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// One step of a query run. Each non-terminal state owns exactly what the next step needs.
#[derive(Debug)]
pub enum PipelineState {
    Received {
        request: QueryRequest,
    },
    Loaded {
        question: String,
        document: SourceDocument,
    },
    Chunked {
        question: String,
        chunks: Vec<Chunk>,
    },
    Indexed {
        question: String,
        index: VectorIndex,
    },
    Retrieved {
        question: String,
        retrieval: RetrievalResult,
    },
    Synthesized {
        raw: RawAnswer,
    },
    Validated {
        raw: RawAnswer,
        structured: StructuredAnswer,
    },
    Done(QueryResult),
    Failed {
        stage: PipelineStage,
        error: PipelineError,
    },
}

impl PipelineState {
    /// For `Failed`, the stage at which the run stopped.
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Received { .. } => PipelineStage::Received,
            Self::Loaded { .. } => PipelineStage::Loaded,
            Self::Chunked { .. } => PipelineStage::Chunked,
            Self::Indexed { .. } => PipelineStage::Indexed,
            Self::Retrieved { .. } => PipelineStage::Retrieved,
            Self::Synthesized { .. } => PipelineStage::Synthesized,
            Self::Validated { .. } => PipelineStage::Validated,
            Self::Done(_) => PipelineStage::Done,
            Self::Failed { stage, .. } => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed { .. })
    }
}

fn settle(stage: PipelineStage, outcome: Result<PipelineState, PipelineError>) -> PipelineState {
    outcome.unwrap_or_else(|error| PipelineState::Failed { stage, error })
}

/// Sequences load, chunk, index, retrieve, synthesize and validate for each query.
///
/// Immutable once built; share it behind an `Arc` across concurrent requests.
pub struct Pipeline {
    loader: Arc<dyn DocumentLoader>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn GenerationProvider>>,
    synthesizer: AnswerSynthesizer,
    validator: StructuredOutputValidator,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        loader: Arc<dyn DocumentLoader>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        generator: Option<Arc<dyn GenerationProvider>>,
        options: PipelineOptions,
    ) -> Self {
        let synthesizer = AnswerSynthesizer::new(
            generator.clone(),
            options.schema.clone(),
            options.generate_timeout,
        );
        let validator = StructuredOutputValidator::new(options.schema.clone())
            .with_repair_provider(generator.clone(), options.generate_timeout);

        Self {
            loader,
            embedder,
            generator,
            synthesizer,
            validator,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            llm_initialized: self.generator.is_some(),
            embeddings_initialized: self.embedder.is_some(),
        }
    }

    /// Runs one query to completion. Dropping the returned future abandons any in-flight call.
    pub async fn run(&self, request: QueryRequest) -> QueryResult {
        let request_id = Uuid::new_v4();
        let span = info_span!("query", %request_id, url = %request.url);
        self.drive(PipelineState::Received { request })
            .instrument(span)
            .await
    }

    async fn drive(&self, mut state: PipelineState) -> QueryResult {
        loop {
            state = match state {
                PipelineState::Done(result) => return result,
                PipelineState::Failed { stage, error } => {
                    warn!(
                        stage = %stage,
                        status = error.status_code(),
                        error = %error,
                        "query failed"
                    );
                    return QueryResult::failure(stage, &error);
                }
                pending => self.advance(pending).await,
            };
        }
    }

    /// Performs a single transition. Terminal states are returned unchanged.
    pub async fn advance(&self, state: PipelineState) -> PipelineState {
        let next = match state {
            PipelineState::Received { request } => match self.accept(&request) {
                Ok(()) => settle(PipelineStage::Loaded, self.load(request).await),
                Err(error) => PipelineState::Failed {
                    stage: PipelineStage::Received,
                    error,
                },
            },
            PipelineState::Loaded { question, document } => {
                settle(PipelineStage::Chunked, self.chunk(question, &document))
            }
            PipelineState::Chunked { question, chunks } => {
                settle(PipelineStage::Indexed, self.index(question, chunks).await)
            }
            PipelineState::Indexed { question, index } => {
                settle(PipelineStage::Retrieved, self.retrieve(question, &index).await)
            }
            PipelineState::Retrieved {
                question,
                retrieval,
            } => settle(
                PipelineStage::Synthesized,
                self.synthesize(&question, &retrieval).await,
            ),
            PipelineState::Synthesized { raw } => {
                settle(PipelineStage::Validated, self.validate(raw).await)
            }
            PipelineState::Validated { raw, structured } => PipelineState::Done(
                QueryResult::success(structured.concise(), raw.payload(), structured),
            ),
            terminal @ (PipelineState::Done(_) | PipelineState::Failed { .. }) => return terminal,
        };

        if !matches!(next, PipelineState::Failed { .. }) {
            info!(stage = %next.stage(), "stage complete");
        }
        next
    }

    /// Rejects the request before any fetch when it is malformed or a provider is missing.
    fn accept(&self, request: &QueryRequest) -> Result<(), PipelineError> {
        request.validate()?;
        self.options.validate()?;
        self.embedder()?;
        if self.generator.is_none() {
            return Err(PipelineError::LlmUnavailable(
                "no generation provider is configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn load(&self, request: QueryRequest) -> Result<PipelineState, PipelineError> {
        let url = request.url.trim();
        let document = tokio::time::timeout(self.options.fetch_timeout, self.loader.load(url))
            .await
            .map_err(|_| PipelineError::Fetch(FetchError::Timeout))??;
        debug!(chars = document.raw_text.chars().count(), "document loaded");

        Ok(PipelineState::Loaded {
            question: request.question.trim().to_string(),
            document,
        })
    }

    fn chunk(
        &self,
        question: String,
        document: &SourceDocument,
    ) -> Result<PipelineState, PipelineError> {
        let config = ChunkingConfig::try_from(&self.options)?;
        let chunks = split_with(document, &config);
        if chunks.is_empty() {
            return Err(PipelineError::Extraction(format!(
                "no text to index at {}",
                document.url
            )));
        }
        debug!(chunks = chunks.len(), "document chunked");
        Ok(PipelineState::Chunked { question, chunks })
    }

    async fn index(
        &self,
        question: String,
        chunks: Vec<Chunk>,
    ) -> Result<PipelineState, PipelineError> {
        let embedder = self.embedder()?;
        let index = VectorIndex::build(chunks, embedder.as_ref(), self.options.embed_timeout).await?;
        Ok(PipelineState::Indexed { question, index })
    }

    async fn retrieve(
        &self,
        question: String,
        index: &VectorIndex,
    ) -> Result<PipelineState, PipelineError> {
        let retriever = Retriever::new(self.embedder()?.clone(), self.options.embed_timeout)
            .with_top_k(self.options.top_k);
        let retrieval = retriever.retrieve(index, &question).await?;
        debug!(chunk_ids = ?retrieval.chunk_ids(), "chunks retrieved");
        Ok(PipelineState::Retrieved {
            question,
            retrieval,
        })
    }

    async fn synthesize(
        &self,
        question: &str,
        retrieval: &RetrievalResult,
    ) -> Result<PipelineState, PipelineError> {
        let mut attempt = 0usize;
        loop {
            match self.synthesizer.synthesize(question, retrieval).await {
                Ok(raw) => return Ok(PipelineState::Synthesized { raw }),
                Err(error) if error.is_retryable() && attempt < self.options.llm_max_retries => {
                    attempt += 1;
                    let delay = retry_backoff(self.options.retry_backoff, attempt);
                    warn!(
                        attempt,
                        max_retries = self.options.llm_max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn validate(&self, raw: RawAnswer) -> Result<PipelineState, PipelineError> {
        let structured = self.validator.validate(&raw).await?;
        Ok(PipelineState::Validated { raw, structured })
    }

    fn embedder(&self) -> Result<&Arc<dyn EmbeddingProvider>, PipelineError> {
        self.embedder.as_ref().ok_or_else(|| {
            PipelineError::Embedding("no embedding provider is configured".to_string())
        })
    }
}

/// `base * 2^(attempt - 1)`, capped at 32x.
fn retry_backoff(base: Duration, attempt: usize) -> Duration {
    let exponent = attempt.saturating_sub(1).min(5) as u32;
    base.saturating_mul(1 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{LoadError, ProviderError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GRASS_PAGE: &str = "The sky is blue. Grass is green. Water is wet.";
    const VALID: &str =
        r#"{"summary": "Grass is green.", "supporting_points": ["Grass is green."]}"#;

    struct StaticLoader {
        text: String,
    }

    #[async_trait]
    impl DocumentLoader for StaticLoader {
        async fn load(&self, url: &str) -> Result<SourceDocument, LoadError> {
            Ok(SourceDocument::new(url, self.text.clone()))
        }
    }

    /// Counts calls without ever producing a document.
    #[derive(Default)]
    struct CountingLoader {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl DocumentLoader for CountingLoader {
        async fn load(&self, url: &str) -> Result<SourceDocument, LoadError> {
            *self.calls.lock().unwrap() += 1;
            Ok(SourceDocument::new(url, GRASS_PAGE))
        }
    }

    struct StalledLoader;

    #[async_trait]
    impl DocumentLoader for StalledLoader {
        async fn load(&self, _url: &str) -> Result<SourceDocument, LoadError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(SourceDocument::new("https://example.com", GRASS_PAGE))
        }
    }

    /// Replays scripted replies in order and records every prompt it receives.
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<String, ProviderError>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        fn prompt(&self, index: usize) -> String {
            self.prompts.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::Misconfigured("script exhausted".into())))
        }
    }

    fn server_error() -> ProviderError {
        ProviderError::Status {
            provider: "scripted".to_string(),
            status: 500,
            body: "internal".to_string(),
        }
    }

    fn grass_options() -> PipelineOptions {
        PipelineOptions {
            chunk_max_chars: 20,
            chunk_overlap_chars: 5,
            retry_backoff: Duration::from_millis(1),
            ..PipelineOptions::default()
        }
    }

    fn build_pipeline(
        loader: Arc<dyn DocumentLoader>,
        generator: Option<Arc<dyn GenerationProvider>>,
        options: PipelineOptions,
    ) -> Pipeline {
        Pipeline::new(
            loader,
            Some(Arc::new(CharacterNgramEmbedder::default())),
            generator,
            options,
        )
    }

    fn grass_loader() -> Arc<dyn DocumentLoader> {
        Arc::new(StaticLoader {
            text: GRASS_PAGE.to_string(),
        })
    }

    fn grass_request() -> QueryRequest {
        QueryRequest::new("https://example.com/colors", "What color is grass?")
    }

    #[tokio::test]
    async fn answers_from_the_most_relevant_chunk() {
        let generator = ScriptedGenerator::new(vec![Ok(VALID.to_string())]);
        let pipeline = build_pipeline(grass_loader(), Some(generator.clone()), grass_options());

        let result = pipeline.run(grass_request()).await;

        assert!(result.is_success(), "unexpected error: {:?}", result.error());
        assert_eq!(result.answer(), Some("Grass is green."));
        assert_eq!(result.status_code(), 200);
        let raw = result.raw().unwrap();
        assert_eq!(raw["query"], "What color is grass?");
        assert_eq!(raw["provider"], "scripted");
        assert_eq!(
            result.structured().unwrap().list("supporting_points"),
            vec!["Grass is green."]
        );

        let prompt = generator.prompt(0);
        assert!(prompt.contains("[1] (chunk 1)\nGrass is green."));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn fetch_timeout_fails_with_only_an_error() {
        let options = PipelineOptions {
            fetch_timeout: Duration::from_millis(50),
            ..grass_options()
        };
        let generator = ScriptedGenerator::new(vec![Ok(VALID.to_string())]);
        let pipeline = build_pipeline(Arc::new(StalledLoader), Some(generator.clone()), options);

        let result = pipeline.run(grass_request()).await;

        assert_eq!(result.error(), Some("fetch timeout"));
        assert!(result.answer().is_none());
        assert!(result.raw().is_none());
        assert!(result.structured().is_none());
        assert_eq!(result.status_code(), 504);
        assert_eq!(result.failure_info().unwrap().stage, PipelineStage::Loaded);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn malformed_output_is_repaired_once() {
        let generator = ScriptedGenerator::new(vec![
            Ok("Grass is green, obviously.".to_string()),
            Ok(VALID.to_string()),
        ]);
        let pipeline = build_pipeline(grass_loader(), Some(generator.clone()), grass_options());

        let result = pipeline.run(grass_request()).await;

        assert!(result.is_success(), "unexpected error: {:?}", result.error());
        assert_eq!(result.structured().unwrap().text("summary"), Some("Grass is green."));
        assert_eq!(generator.calls(), 2);
        assert!(generator.prompt(1).contains("Grass is green, obviously."));
    }

    #[tokio::test]
    async fn output_still_invalid_after_repair_fails_closed() {
        let generator = ScriptedGenerator::new(vec![
            Ok("no json here".to_string()),
            Ok("still none".to_string()),
        ]);
        let pipeline = build_pipeline(grass_loader(), Some(generator.clone()), grass_options());

        let result = pipeline.run(grass_request()).await;

        assert!(result.answer().is_none());
        assert_eq!(result.status_code(), 502);
        assert_eq!(result.failure_info().unwrap().stage, PipelineStage::Validated);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn missing_generator_is_unavailable_before_fetching() {
        let loader = Arc::new(CountingLoader::default());
        let pipeline = build_pipeline(loader.clone(), None, grass_options());

        let result = pipeline.run(grass_request()).await;

        assert!(result.answer().is_none());
        assert!(result.error().unwrap().contains("unavailable"));
        assert_eq!(result.status_code(), 503);
        assert_eq!(result.failure_info().unwrap().stage, PipelineStage::Received);
        assert_eq!(*loader.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_embedder_fails_before_fetching() {
        let loader = Arc::new(CountingLoader::default());
        let generator = ScriptedGenerator::new(vec![Ok(VALID.to_string())]);
        let pipeline = Pipeline::new(loader.clone(), None, Some(generator.clone()), grass_options());

        let result = pipeline.run(grass_request()).await;

        assert!(result.error().unwrap().contains("embedding"));
        assert_eq!(result.failure_info().unwrap().stage, PipelineStage::Received);
        assert_eq!(*loader.calls.lock().unwrap(), 0);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn invocation_failures_are_retried_with_a_bound() {
        let generator = ScriptedGenerator::new(vec![Err(server_error()), Ok(VALID.to_string())]);
        let pipeline = build_pipeline(grass_loader(), Some(generator.clone()), grass_options());
        let result = pipeline.run(grass_request()).await;
        assert!(result.is_success());
        assert_eq!(generator.calls(), 2);

        let options = PipelineOptions {
            llm_max_retries: 1,
            ..grass_options()
        };
        let generator = ScriptedGenerator::new(vec![
            Err(server_error()),
            Err(server_error()),
            Ok(VALID.to_string()),
        ]);
        let pipeline = build_pipeline(grass_loader(), Some(generator.clone()), options);
        let result = pipeline.run(grass_request()).await;
        assert_eq!(result.status_code(), 502);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_requests_and_options_fail_on_receipt() {
        let pipeline = build_pipeline(grass_loader(), None, grass_options());
        let result = pipeline
            .run(QueryRequest::new("  ", "What color is grass?"))
            .await;
        assert_eq!(result.status_code(), 400);
        assert_eq!(result.failure_info().unwrap().stage, PipelineStage::Received);

        let options = PipelineOptions {
            chunk_overlap_chars: 20,
            ..grass_options()
        };
        let pipeline = build_pipeline(grass_loader(), None, options);
        let result = pipeline.run(grass_request()).await;
        assert_eq!(result.status_code(), 500);
    }

    #[tokio::test]
    async fn empty_document_is_an_extraction_error() {
        let loader = Arc::new(StaticLoader {
            text: String::new(),
        });
        let generator = ScriptedGenerator::new(vec![Ok(VALID.to_string())]);
        let pipeline = build_pipeline(loader, Some(generator), grass_options());

        let result = pipeline.run(grass_request()).await;

        assert_eq!(result.status_code(), 422);
        assert_eq!(result.failure_info().unwrap().stage, PipelineStage::Chunked);
    }

    #[tokio::test]
    async fn advance_walks_every_stage_in_order() {
        let generator = ScriptedGenerator::new(vec![Ok(VALID.to_string())]);
        let pipeline = build_pipeline(grass_loader(), Some(generator), grass_options());

        let mut state = PipelineState::Received {
            request: grass_request(),
        };
        let mut stages = vec![state.stage()];
        while !state.is_terminal() {
            state = pipeline.advance(state).await;
            stages.push(state.stage());
        }

        assert_eq!(
            stages,
            vec![
                PipelineStage::Received,
                PipelineStage::Loaded,
                PipelineStage::Chunked,
                PipelineStage::Indexed,
                PipelineStage::Retrieved,
                PipelineStage::Synthesized,
                PipelineStage::Validated,
                PipelineStage::Done,
            ]
        );
        assert!(matches!(pipeline.advance(state).await, PipelineState::Done(_)));
    }

    #[test]
    fn readiness_reflects_configured_providers() {
        let pipeline = Pipeline::new(grass_loader(), None, None, PipelineOptions::default());
        assert_eq!(
            pipeline.readiness(),
            Readiness {
                llm_initialized: false,
                embeddings_initialized: false,
            }
        );
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(retry_backoff(base, 1), Duration::from_millis(500));
        assert_eq!(retry_backoff(base, 2), Duration::from_millis(1_000));
        assert_eq!(retry_backoff(base, 3), Duration::from_millis(2_000));
    }
}
