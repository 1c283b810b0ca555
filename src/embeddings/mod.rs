//! Text embedding providers.
//!
//! - `openai`: OpenAI-compatible HTTP embeddings endpoint
//! - `local`: on-device fastembed model (feature `local-embeddings`)
//!
//! Every provider goes through [`prepare_input`]: blank text is rejected and
//! text above the configured length is truncated, never rejected.

#[cfg(feature = "local-embeddings")]
pub mod local;
pub mod openai;

use std::sync::Arc;

use crate::config::{EmbeddingConfig, EmbeddingProvider};

pub use openai::OpenAiEmbedder;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding input is empty")]
    EmptyInput,

    #[error("embedding provider failed (retryable: {retryable}): {message}")]
    Provider { retryable: bool, message: String },
}

impl EmbeddingError {
    pub fn retryable(message: impl Into<String>) -> Self {
        EmbeddingError::Provider {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        EmbeddingError::Provider {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Converts text into a fixed-dimension vector for one model.
pub trait TextEmbedder: Send + Sync {
    /// Model tag stored next to every vector this embedder produces.
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Trims `text` and truncates it to `max_chars` characters.
pub fn prepare_input(text: &str, max_chars: usize) -> Result<&str, EmbeddingError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(EmbeddingError::EmptyInput);
    }

    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => Ok(text[..byte_idx].trim_end()),
        None => Ok(text),
    }
}

/// Builds the provider selected in config.
pub fn build_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn TextEmbedder>> {
    match config.provider {
        EmbeddingProvider::OpenAi => Ok(Arc::new(OpenAiEmbedder::from_config(config)?)),
        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::Local => Ok(Arc::new(local::LocalEmbedder::from_config(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::Local => {
            anyhow::bail!("local embeddings require the `local-embeddings` feature")
        }
    }
}
