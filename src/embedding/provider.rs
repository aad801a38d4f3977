//! Embedding provider trait and supporting types.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::ImageRecord;
use crate::embedding::Embedding;

/// Errors that can occur while producing embeddings.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, timeout, rate limit or server error. Safe to retry.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Authentication failure, rejected request or malformed response. Never retried.
    #[error("permanent provider failure: {0}")]
    Permanent(String),

    /// Local weights are missing or unusable.
    #[error("failed to load model: {0}")]
    ModelLoad(String),
}

impl ProviderError {
    /// Whether the caller may retry the request with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// What to embed.
#[derive(Debug, Clone, Copy)]
pub enum EmbeddingInput<'a> {
    /// A search query.
    Query(&'a str),
    /// An indexed image.
    Image(&'a ImageRecord),
}

impl<'a> EmbeddingInput<'a> {
    /// Text representation for text-only models.
    pub fn text(&self) -> &'a str {
        match self {
            Self::Query(text) => text,
            Self::Image(record) => &record.description,
        }
    }
}

/// Trait for embedding backends (local model, remote API).
///
/// Implementations are deterministic: identical input and identical model
/// weights yield identical vectors, and every vector from one instance has
/// the same dimensionality.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Backend family name (e.g., "local", "remote").
    fn name(&self) -> &str;

    /// Identity of the model producing the vectors. Caches record this as
    /// their provenance.
    fn model_id(&self) -> &str;

    /// Vector dimensionality, when known before the first call.
    fn dimension(&self) -> Option<usize>;

    /// Embeds a single input.
    async fn embed(&self, input: EmbeddingInput<'_>) -> ProviderResult<Embedding>;
}
