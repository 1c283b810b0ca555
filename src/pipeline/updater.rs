use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    embeddings::{EmbeddingError, TextEmbedder},
    ids::ItemId,
    items::{Embedding, ItemPatch, ItemStore, StoreError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// Both description and title are blank.
    NoText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NotFound,
    Provider { retryable: bool, message: String },
    Store(String),
    DimensionMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NotFound => write!(f, "item not found"),
            FailureReason::Provider { retryable, message } => {
                write!(f, "provider error (retryable: {retryable}): {message}")
            }
            FailureReason::Store(msg) => write!(f, "store error: {msg}"),
            FailureReason::DimensionMismatch { expected, got } => write!(
                f,
                "provider returned {got} dimensions, expected {expected}"
            ),
        }
    }
}

/// Result of one embedding run. Never an error: callers only branch on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated { dimensions: usize },
    Skipped { reason: SkipReason },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Updated,
    Skipped,
    Failed,
}

/// Wire shape of an [`UpdateOutcome`]: `{status, reason?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl UpdateOutcome {
    pub fn status(&self) -> UpdateStatus {
        match self {
            UpdateOutcome::Updated { .. } => UpdateStatus::Updated,
            UpdateOutcome::Skipped { .. } => UpdateStatus::Skipped,
            UpdateOutcome::Failed { .. } => UpdateStatus::Failed,
        }
    }

    /// True for provider failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Failed {
                reason: FailureReason::Provider { retryable: true, .. }
            }
        )
    }

    /// True for provider failures that point at misconfiguration.
    pub fn is_fatal_provider_error(&self) -> bool {
        matches!(
            self,
            UpdateOutcome::Failed {
                reason: FailureReason::Provider { retryable: false, .. }
            }
        )
    }

    pub fn report(&self) -> UpdateReport {
        let reason = match self {
            UpdateOutcome::Updated { .. } => None,
            UpdateOutcome::Skipped {
                reason: SkipReason::NoText,
            } => Some("item has no title or description".to_string()),
            UpdateOutcome::Failed { reason } => Some(reason.to_string()),
        };

        UpdateReport {
            status: self.status(),
            reason,
        }
    }
}

/// Derives text, embeds it and persists the vector for a single item.
///
/// Shared by the trigger listener, backfill and the request handlers.
pub struct EmbeddingUpdater {
    store: Arc<dyn ItemStore>,
    embedder: Arc<dyn TextEmbedder>,
}

impl EmbeddingUpdater {
    pub fn new(store: Arc<dyn ItemStore>, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { store, embedder }
    }

    pub fn model(&self) -> &str {
        self.embedder.model()
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Embeds the item and overwrites its vector, persisting it before
    /// returning.
    ///
    /// Re-running for unchanged text converges on an equivalent vector. On
    /// any failure nothing is written, so the prior vector state survives.
    pub fn generate(&self, id: &ItemId) -> UpdateOutcome {
        self.generate_with(id, Persist::Now)
    }

    /// Same as [`generate`](Self::generate), but the vector only reaches disk
    /// on the store's next flush. Used by batch runs.
    pub fn generate_deferred(&self, id: &ItemId) -> UpdateOutcome {
        self.generate_with(id, Persist::OnFlush)
    }

    fn generate_with(&self, id: &ItemId, persist: Persist) -> UpdateOutcome {
        let outcome = self.run(id, persist);

        match &outcome {
            UpdateOutcome::Updated { dimensions } => {
                log::info!("item {id}: saved {dimensions}-dim embedding")
            }
            UpdateOutcome::Skipped { .. } => log::info!("item {id}: no description/title to embed"),
            UpdateOutcome::Failed { reason } => log::debug!("item {id}: embedding failed: {reason}"),
        }

        outcome
    }

    fn run(&self, id: &ItemId, persist: Persist) -> UpdateOutcome {
        let item = match self.store.get(id) {
            Ok(Some(item)) => item,
            Ok(None) => return failed(FailureReason::NotFound),
            Err(err) => return failed(FailureReason::Store(err.to_string())),
        };

        let Some(text) = item.derived_text() else {
            return UpdateOutcome::Skipped {
                reason: SkipReason::NoText,
            };
        };

        let vector = match self.embedder.embed(text) {
            Ok(vector) => vector,
            Err(EmbeddingError::EmptyInput) => {
                return UpdateOutcome::Skipped {
                    reason: SkipReason::NoText,
                }
            }
            Err(EmbeddingError::Provider { retryable, message }) => {
                return failed(FailureReason::Provider { retryable, message })
            }
        };

        let expected = self.embedder.dimensions();
        if vector.len() != expected {
            return failed(FailureReason::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }

        let dimensions = vector.len();
        let embedding = Embedding {
            vector,
            model: self.embedder.model().to_string(),
            embedded_at: Utc::now(),
        };

        let patch = ItemPatch::embedding(embedding);
        let stored = match persist {
            Persist::Now => self.store.update(id, patch),
            Persist::OnFlush => self.store.update_deferred(id, patch),
        };

        match stored {
            Ok(_) => UpdateOutcome::Updated { dimensions },
            // deleted while the provider call was in flight
            Err(StoreError::NotFound(_)) => failed(FailureReason::NotFound),
            Err(err) => failed(FailureReason::Store(err.to_string())),
        }
    }
}

#[derive(Clone, Copy)]
enum Persist {
    Now,
    OnFlush,
}

fn failed(reason: FailureReason) -> UpdateOutcome {
    UpdateOutcome::Failed { reason }
}
