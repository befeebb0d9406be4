/// Embedder trait and shared types for text embedding.
///
/// The embedding model is an opaque `text -> vector` function. Adapters report
/// failures through [`EmbedderError`]; callers wrap every call in
/// [`retry::embed_with_retry`].
pub mod http;
pub mod mock;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{EmbeddingConfig, EmbeddingProvider};

/// Errors that can occur during embedding operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbedderError {
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),

    #[error("embedding request rejected: {0}")]
    Rejected(String),
}

impl EmbedderError {
    /// Failure classes worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedderError::Unavailable(_) | EmbedderError::Timeout(_))
    }
}

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Short identifier used in logs.
    fn name(&self) -> &str;
}

/// Build the embedder selected by the configuration.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbedderError> {
    match config.provider {
        EmbeddingProvider::Http => Ok(Arc::new(http::HttpEmbedder::new(
            &config.endpoint,
            &config.model,
            config.dimensions,
            Duration::from_secs(config.timeout_secs),
        )?)),
        EmbeddingProvider::Hashing => Ok(Arc::new(mock::HashingEmbedder::new(config.dimensions))),
    }
}
