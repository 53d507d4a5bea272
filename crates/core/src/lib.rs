pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod retriever;
pub mod schema;
pub mod synthesizer;
pub mod traits;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use chunking::{split, split_with, ChunkingConfig};
pub use embeddings::{CharacterNgramEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{FetchError, LoadError, PipelineError, ProviderError};
pub use index::{cosine_similarity, IndexEntry, VectorIndex};
pub use loader::{extract_readable_text, WebPageLoader};
pub use models::{
    Chunk, EmbeddingVector, PipelineOptions, PipelineStage, QueryRequest, QueryResult, Readiness,
    RetrievalResult, ScoredChunk, SourceDocument, DEFAULT_TOP_K,
};
pub use orchestrator::{Pipeline, PipelineState};
pub use providers::{GeminiProvider, OpenAiChatProvider, OpenAiEmbeddingProvider};
pub use retriever::Retriever;
pub use schema::{AnswerSchema, FieldKind, SchemaField, StructuredAnswer};
pub use synthesizer::{AnswerSynthesizer, RawAnswer};
pub use traits::{DocumentLoader, EmbeddingProvider, GenerationProvider};
pub use validator::StructuredOutputValidator;
