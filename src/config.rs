use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

pub const CONFIG_FILE: &str = "config.yaml";

/// Default embedding model, as used by the item board.
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSIONS: usize = 1536;
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Characters, not tokens; longer input is truncated.
const DEFAULT_MAX_INPUT_CHARS: usize = 8000;

const DEFAULT_BACKFILL_CONCURRENCY: usize = 2;
/// Upper bound for backfill workers, from config or a per-run override.
pub const MAX_BACKFILL_CONCURRENCY: usize = 64;
const DEFAULT_BACKFILL_MIN_DELAY_MS: u64 = 200;
const DEFAULT_BACKFILL_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_BACKFILL_BASE_BACKOFF_MS: u64 = 1000;
const DEFAULT_BACKFILL_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_BACKFILL_JITTER_MS: u64 = 500;

const DEFAULT_TRIGGER_MAX_THREADS: u16 = 8;

const DEFAULT_MATCH_K: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Model tag, stored with every vector.
    #[serde(default = "default_model")]
    pub model: String,

    /// Vector length produced by `model`.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Falls back to `OPENAI_API_KEY` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request timeout; a timeout counts as a retryable failure.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,

    /// Model cache for the local provider. Defaults to the base directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_model(),
            dimensions: DEFAULT_DIMENSIONS,
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            cache_dir: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Worker threads calling the provider at once.
    #[serde(default = "default_backfill_concurrency")]
    pub concurrency: usize,

    /// Minimum gap between the starts of two provider calls.
    #[serde(default = "default_backfill_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Total attempts per item, first try included.
    #[serde(default = "default_backfill_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backfill_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_backfill_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backfill_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_BACKFILL_CONCURRENCY,
            min_delay_ms: DEFAULT_BACKFILL_MIN_DELAY_MS,
            max_attempts: DEFAULT_BACKFILL_MAX_ATTEMPTS,
            base_backoff_ms: DEFAULT_BACKFILL_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_BACKFILL_MAX_BACKOFF_MS,
            jitter_ms: DEFAULT_BACKFILL_JITTER_MS,
            page_size: crate::items::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Upper bound on simultaneously running trigger workers.
    #[serde(default = "default_trigger_max_threads")]
    pub max_threads: u16,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_TRIGGER_MAX_THREADS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_match_k")]
    pub default_k: usize,

    /// Candidates scoring below this are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f64>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            default_k: DEFAULT_MATCH_K,
            min_similarity: None,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_input_chars() -> usize {
    DEFAULT_MAX_INPUT_CHARS
}

fn default_backfill_concurrency() -> usize {
    DEFAULT_BACKFILL_CONCURRENCY
}

fn default_backfill_min_delay_ms() -> u64 {
    DEFAULT_BACKFILL_MIN_DELAY_MS
}

fn default_backfill_max_attempts() -> u32 {
    DEFAULT_BACKFILL_MAX_ATTEMPTS
}

fn default_backfill_base_backoff_ms() -> u64 {
    DEFAULT_BACKFILL_BASE_BACKOFF_MS
}

fn default_backfill_max_backoff_ms() -> u64 {
    DEFAULT_BACKFILL_MAX_BACKOFF_MS
}

fn default_backfill_jitter_ms() -> u64 {
    DEFAULT_BACKFILL_JITTER_MS
}

fn default_page_size() -> usize {
    crate::items::DEFAULT_PAGE_SIZE
}

fn default_trigger_max_threads() -> u16 {
    DEFAULT_TRIGGER_MAX_THREADS
}

fn default_match_k() -> usize {
    DEFAULT_MATCH_K
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let emb = &self.embedding;
        anyhow::ensure!(!emb.model.trim().is_empty(), "embedding.model must not be empty");
        anyhow::ensure!(emb.dimensions > 0, "embedding.dimensions must be greater than 0");
        anyhow::ensure!(emb.timeout_secs > 0, "embedding.timeout_secs must be greater than 0");
        anyhow::ensure!(
            emb.max_input_chars > 0,
            "embedding.max_input_chars must be greater than 0"
        );

        let bf = &self.backfill;
        anyhow::ensure!(
            (1..=MAX_BACKFILL_CONCURRENCY).contains(&bf.concurrency),
            "backfill.concurrency must be between 1 and {MAX_BACKFILL_CONCURRENCY}, got {}",
            bf.concurrency
        );
        anyhow::ensure!(bf.max_attempts > 0, "backfill.max_attempts must be at least 1");
        anyhow::ensure!(bf.page_size > 0, "backfill.page_size must be greater than 0");
        anyhow::ensure!(
            bf.base_backoff_ms <= bf.max_backoff_ms,
            "backfill.base_backoff_ms ({}) exceeds backfill.max_backoff_ms ({})",
            bf.base_backoff_ms,
            bf.max_backoff_ms
        );

        anyhow::ensure!(
            self.trigger.max_threads > 0,
            "trigger.max_threads must be greater than 0"
        );

        anyhow::ensure!(self.matching.default_k >= 1, "matching.default_k must be at least 1");
        if let Some(min) = self.matching.min_similarity {
            anyhow::ensure!(
                (-1.0..=1.0).contains(&min),
                "matching.min_similarity must be between -1.0 and 1.0, got {min}"
            );
        }

        Ok(())
    }

    pub fn load_with(base_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_path = base_path.as_ref();
        let store = storage::BackendLocal::new(base_path)
            .with_context(|| format!("failed to open {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(
                CONFIG_FILE,
                serde_yml::to_string(&Self::default())?.as_bytes(),
            )?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        if config.embedding.cache_dir.is_none() {
            config.embedding.cache_dir = Some(config.base_path.clone());
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let mut to_save = self.clone();
        if to_save.embedding.cache_dir.as_deref() == Some(self.base_path.as_path()) {
            to_save.embedding.cache_dir = None;
        }

        let config_str = serde_yml::to_string(&to_save)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }
}
