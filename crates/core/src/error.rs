use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("extraction error: {0}")]
    Extraction(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("language model unavailable: {0}")]
    LlmUnavailable(String),

    #[error("language model invocation failed: {0}")]
    LlmInvocation(String),

    #[error("structured output error: {0}")]
    StructuredOutput(String),
}

impl PipelineError {
    /// HTTP-equivalent status for a transport layer sitting on top of the pipeline.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Config(_) => 500,
            Self::Fetch(FetchError::Timeout) => 504,
            Self::Fetch(FetchError::InvalidUrl(_)) => 400,
            Self::Fetch(_) => 502,
            Self::Extraction(_) => 422,
            Self::Embedding(_) => 502,
            Self::LlmUnavailable(_) => 503,
            Self::LlmInvocation(_) => 502,
            Self::StructuredOutput(_) => 502,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LlmInvocation(_))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timeout")]
    Timeout,

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("fetch failed: {0}")]
    Http(reqwest::Error),

    #[error("fetch returned status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error)
        }
    }
}

/// Loader failures, split the way the pipeline reports them.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{0}")]
    Extraction(String),
}

impl From<LoadError> for PipelineError {
    fn from(error: LoadError) -> Self {
        match error {
            LoadError::Fetch(fetch) => Self::Fetch(fetch),
            LoadError::Extraction(details) => Self::Extraction(details),
        }
    }
}

/// Failure reported by an embedding or generation provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request timed out")]
    Timeout,

    #[error("http error: {0}")]
    Http(reqwest::Error),

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {provider}: {details}")]
    InvalidResponse { provider: String, details: String },

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(error)
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
