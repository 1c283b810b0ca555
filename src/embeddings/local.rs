//! On-device embedding model backed by fastembed.
//!
//! - Model downloaded into `<cache_dir>/models` on first use
//! - Dimensions probed once at load
//! - Every failure is fatal: there is no remote service to wait for

use fastembed::{InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Mutex;

use super::{prepare_input, EmbeddingError, TextEmbedder};
use crate::config::EmbeddingConfig;

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct LocalEmbedder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
    max_input_chars: usize,
}

impl LocalEmbedder {
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        max_input_chars: usize,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::fatal(format!("failed to create models directory: {e}"))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::fatal(format!("model initialization failed: {e}")))?;

        let dimensions = probe_dimensions(&mut model)?;
        log::info!("Loaded local embedding model '{model_name}' ({dimensions} dims)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
            max_input_chars,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let cache_dir = config
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("itemmatch"));
        let embedder = Self::new(&config.model, cache_dir, config.max_input_chars)?;

        if embedder.dimensions != config.dimensions {
            log::warn!(
                "embedding.dimensions is {} but model '{}' produces {}; using the model's",
                config.dimensions,
                config.model,
                embedder.dimensions
            );
        }

        Ok(embedder)
    }
}

impl TextEmbedder for LocalEmbedder {
    fn model(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = prepare_input(text, self.max_input_chars)?;

        let mut model = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::fatal(format!("failed to acquire model lock: {e}")))?;

        model
            .embed(vec![input], None)
            .map_err(|e| EmbeddingError::fatal(format!("embedding generation failed: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::fatal("no embedding returned"))
    }
}

fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        _ => Err(EmbeddingError::fatal(format!(
            "unknown local model: {name}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5"
        ))),
    }
}

fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    model
        .embed(vec!["probe"], None)
        .map_err(|e| EmbeddingError::fatal(format!("failed to probe dimensions: {e}")))?
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::fatal("model returned no embedding"))
}
