mod server;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pageqa_core::providers::gemini::DEFAULT_GEMINI_MODEL;
use pageqa_core::providers::openai::DEFAULT_EMBEDDING_BATCH_SIZE;
use pageqa_core::{
    CharacterNgramEmbedder, EmbeddingProvider, GeminiProvider, GenerationProvider,
    OpenAiChatProvider, OpenAiEmbeddingProvider, Pipeline, PipelineOptions, ProviderError,
    QueryRequest, WebPageLoader, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const OPENAI_EMBEDDING_DIMENSIONS: usize = 1_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LlmBackend {
    Gemini,
    #[value(name = "openai")]
    OpenAi,
    #[value(name = "none")]
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbeddingBackend {
    Ngram,
    #[value(name = "openai")]
    OpenAi,
}

#[derive(Parser)]
#[command(name = "pageqa", version, about = "Answer questions about a single web page")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Generation provider used to synthesize answers.
    #[arg(long, env = "PAGEQA_LLM_PROVIDER", value_enum, default_value_t = LlmBackend::Gemini)]
    llm_provider: LlmBackend,

    /// Google Generative Language API key.
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true)]
    google_api_key: Option<String>,

    /// Gemini model identifier
    #[arg(long, env = "PAGEQA_GEMINI_MODEL", default_value = DEFAULT_GEMINI_MODEL)]
    gemini_model: String,

    /// OpenAI API key, used by the openai chat and embedding providers.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(long, env = "PAGEQA_OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    #[arg(long, env = "PAGEQA_OPENAI_CHAT_MODEL", default_value = "gpt-4o-mini")]
    openai_chat_model: String,

    /// Embedding provider for chunks and questions.
    #[arg(long, env = "PAGEQA_EMBEDDING_PROVIDER", value_enum, default_value_t = EmbeddingBackend::Ngram)]
    embedding_provider: EmbeddingBackend,

    /// Output dimension of the embedding provider.
    #[arg(long, env = "PAGEQA_EMBEDDING_DIMENSIONS")]
    embedding_dimensions: Option<usize>,

    #[arg(long, env = "PAGEQA_OPENAI_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    openai_embedding_model: String,

    /// Inputs per OpenAI embeddings request.
    #[arg(long, env = "PAGEQA_OPENAI_EMBEDDING_BATCH_SIZE", default_value_t = DEFAULT_EMBEDDING_BATCH_SIZE)]
    openai_embedding_batch_size: usize,

    /// Maximum characters per chunk.
    #[arg(long, env = "PAGEQA_CHUNK_MAX_CHARS", default_value_t = 2_000)]
    chunk_max_chars: usize,

    /// Characters shared between consecutive chunks.
    #[arg(long, env = "PAGEQA_CHUNK_OVERLAP_CHARS", default_value_t = 200)]
    chunk_overlap_chars: usize,

    /// Number of chunks passed to the generation provider.
    #[arg(long, env = "PAGEQA_TOP_K", default_value_t = 4)]
    top_k: usize,

    #[arg(long, env = "PAGEQA_FETCH_TIMEOUT_SECS", default_value_t = 20)]
    fetch_timeout_secs: u64,

    #[arg(long, env = "PAGEQA_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    embed_timeout_secs: u64,

    #[arg(long, env = "PAGEQA_GENERATE_TIMEOUT_SECS", default_value_t = 60)]
    generate_timeout_secs: u64,

    /// Retries for failed generation calls, with exponential backoff.
    #[arg(long, env = "PAGEQA_LLM_MAX_RETRIES", default_value_t = 2)]
    llm_max_retries: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question and print the result as JSON.
    Ask {
        /// Page to read.
        #[arg(long)]
        url: String,
        /// Question about the page.
        #[arg(long)]
        question: String,
    },
    /// Serve the query API over HTTP.
    Serve {
        /// Address to bind the HTTP server to (host:port).
        #[arg(long, env = "PAGEQA_BIND", default_value = "127.0.0.1:5000")]
        bind: String,
    },
}

impl Cli {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            chunk_max_chars: self.chunk_max_chars,
            chunk_overlap_chars: self.chunk_overlap_chars,
            top_k: self.top_k,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            embed_timeout: Duration::from_secs(self.embed_timeout_secs.max(1)),
            generate_timeout: Duration::from_secs(self.generate_timeout_secs.max(1)),
            llm_max_retries: self.llm_max_retries,
            ..PipelineOptions::default()
        }
    }

    fn embedder(&self, timeout: Duration) -> Option<Arc<dyn EmbeddingProvider>> {
        let dimensions = self
            .embedding_dimensions
            .unwrap_or(match self.embedding_provider {
                EmbeddingBackend::Ngram => DEFAULT_EMBEDDING_DIMENSIONS,
                EmbeddingBackend::OpenAi => OPENAI_EMBEDDING_DIMENSIONS,
            });
        let built: Result<Arc<dyn EmbeddingProvider>, ProviderError> = match self.embedding_provider
        {
            EmbeddingBackend::Ngram => Ok(Arc::new(CharacterNgramEmbedder::new(dimensions))),
            EmbeddingBackend::OpenAi => OpenAiEmbeddingProvider::new(
                self.openai_api_key.as_deref().unwrap_or_default(),
                &self.openai_base_url,
                &self.openai_embedding_model,
                dimensions,
                timeout,
            )
            .map(|provider| {
                Arc::new(provider.with_batch_size(self.openai_embedding_batch_size))
                    as Arc<dyn EmbeddingProvider>
            }),
        };

        match built {
            Ok(provider) => Some(provider),
            Err(error) => {
                warn!(provider = ?self.embedding_provider, %error, "embedding provider unavailable");
                None
            }
        }
    }

    fn generator(&self, timeout: Duration) -> Option<Arc<dyn GenerationProvider>> {
        let built: Result<Arc<dyn GenerationProvider>, ProviderError> = match self.llm_provider {
            LlmBackend::Disabled => {
                info!("generation provider disabled");
                return None;
            }
            LlmBackend::Gemini => GeminiProvider::new(
                self.google_api_key.as_deref().unwrap_or_default(),
                &self.gemini_model,
                timeout,
            )
            .map(|provider| Arc::new(provider) as Arc<dyn GenerationProvider>),
            LlmBackend::OpenAi => OpenAiChatProvider::new(
                self.openai_api_key.as_deref().unwrap_or_default(),
                &self.openai_base_url,
                &self.openai_chat_model,
                timeout,
            )
            .map(|provider| Arc::new(provider) as Arc<dyn GenerationProvider>),
        };

        match built {
            Ok(provider) => Some(provider),
            Err(error) => {
                warn!(
                    provider = ?self.llm_provider,
                    %error,
                    "generation provider unavailable; queries will fail until it is configured"
                );
                None
            }
        }
    }

    fn build_pipeline(&self) -> anyhow::Result<Pipeline> {
        let options = self.pipeline_options();
        options.validate().context("invalid pipeline options")?;

        let loader =
            WebPageLoader::new(options.fetch_timeout).context("failed to build HTTP client")?;
        let embedder = self.embedder(options.embed_timeout);
        let generator = self.generator(options.generate_timeout);

        Ok(Pipeline::new(Arc::new(loader), embedder, generator, options))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let pipeline = Arc::new(cli.build_pipeline()?);
    let readiness = pipeline.readiness();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        llm_initialized = readiness.llm_initialized,
        embeddings_initialized = readiness.embeddings_initialized,
        "pageqa boot"
    );

    match cli.command {
        Command::Ask { url, question } => {
            let result = pipeline.run(QueryRequest::new(url, question)).await;
            let rendered =
                serde_json::to_string_pretty(&result).context("failed to encode result")?;
            println!("{rendered}");
            if let Some(error) = result.error() {
                anyhow::bail!("query failed with status {}: {error}", result.status_code());
            }
        }
        Command::Serve { bind } => server::serve(pipeline, &bind).await?,
    }

    Ok(())
}
