use serde::{Deserialize, Serialize};

use crate::{
    ids::ItemId,
    items::{Item, ItemCreate},
    matching::Match,
    pipeline::{BackfillReport, TriggerStatsSnapshot, UpdateReport},
};

use super::errors::AppError;

/// Operations exposed to the CLI, either in-process or through the daemon.
pub trait AppBackend: Send + Sync {
    /// Embeds one item now. Provider failures come back as a `failed`
    /// report; only a missing item is an error.
    fn generate_embedding(&self, id: &ItemId) -> Result<UpdateReport, AppError>;

    fn backfill_embeddings(&self, request: BackfillRequest) -> Result<BackfillReport, AppError>;

    fn find_matches(&self, id: &ItemId, k: Option<usize>) -> Result<Vec<Match>, AppError>;

    /// Stores a new item and hands it to the trigger listener.
    fn create_item(&self, item: ItemCreate) -> Result<Item, AppError>;

    fn get_item(&self, id: &ItemId) -> Result<Item, AppError>;

    /// Removes an item and returns it. Its vector goes with it, so it stops
    /// showing up in matches.
    fn delete_item(&self, id: &ItemId) -> Result<Item, AppError>;

    /// Delivers an "item created" event. Returns once queued.
    fn notify_item_created(&self, id: &ItemId) -> Result<(), AppError>;

    fn status(&self) -> Result<CorpusStatus, AppError>;
}

/// Per-run overrides on top of the `backfill` config section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    #[serde(default)]
    pub include_stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusStatus {
    pub model: String,
    pub dimensions: usize,
    pub total: usize,
    pub no_text: usize,
    pub pending: usize,
    pub embedded: usize,
    pub stale: usize,
    pub trigger: TriggerStatsSnapshot,
    pub backfill_running: bool,
}
