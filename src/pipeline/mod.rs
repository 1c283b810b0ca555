//! Embedding pipeline.
//!
//! - `updater`: derive text, embed, persist for one item
//! - `trigger`: fire-and-forget "item created" intake
//! - `backfill`: paced, bounded batch run over items missing a vector

pub mod backfill;
pub mod trigger;
pub mod updater;

pub use backfill::{BackfillCoordinator, BackfillError, BackfillOptions, BackfillReport};
pub use trigger::{ItemCreated, TriggerListener, TriggerStatsSnapshot};
pub use updater::{EmbeddingUpdater, FailureReason, UpdateOutcome, UpdateReport};
