use std::sync::Arc;

use anyhow::anyhow;

use crate::{
    config::{Config, MAX_BACKFILL_CONCURRENCY},
    embeddings::TextEmbedder,
    ids::ItemId,
    items::{self, Item, ItemCreate, ItemFilter, ItemState, ItemStore},
    matching::{Match, SimilarityMatcher},
    pipeline::{
        BackfillCoordinator, BackfillOptions, BackfillReport, EmbeddingUpdater, FailureReason,
        ItemCreated, TriggerListener, UpdateOutcome, UpdateReport,
    },
};

use super::{backend::*, errors::AppError};

/// In-process backend. Owns every pipeline component; the store and the
/// embedding client are built once and shared.
pub struct AppLocal {
    config: Config,
    store: Arc<dyn ItemStore>,
    updater: Arc<EmbeddingUpdater>,
    trigger: TriggerListener,
    backfill: BackfillCoordinator,
    matcher: SimilarityMatcher,
}

impl AppLocal {
    pub fn new(config: Config, store: Arc<dyn ItemStore>, embedder: Arc<dyn TextEmbedder>) -> Self {
        if embedder.dimensions() != config.embedding.dimensions {
            log::warn!(
                "embedder {} reports {} dimensions, config says {}",
                embedder.model(),
                embedder.dimensions(),
                config.embedding.dimensions
            );
        }

        let updater = Arc::new(EmbeddingUpdater::new(store.clone(), embedder));
        let trigger = TriggerListener::start(updater.clone(), config.trigger.max_threads);
        let backfill = BackfillCoordinator::new(store.clone(), updater.clone());
        let matcher = SimilarityMatcher::new(
            store.clone(),
            config.matching.default_k,
            config.matching.min_similarity,
        );

        Self {
            config,
            store,
            updater,
            trigger,
            backfill,
            matcher,
        }
    }

    /// Drains queued trigger events.
    pub fn shutdown(&self) {
        self.trigger.shutdown();
    }
}

impl AppBackend for AppLocal {
    fn generate_embedding(&self, id: &ItemId) -> Result<UpdateReport, AppError> {
        match self.updater.generate(id) {
            UpdateOutcome::Failed {
                reason: FailureReason::NotFound,
            } => Err(AppError::NotFound(format!("item {id} not found"))),
            outcome => Ok(outcome.report()),
        }
    }

    fn backfill_embeddings(&self, request: BackfillRequest) -> Result<BackfillReport, AppError> {
        let mut opts = BackfillOptions::from_config(&self.config.backfill);
        opts.include_stale = request.include_stale;

        if let Some(concurrency) = request.concurrency {
            if !(1..=MAX_BACKFILL_CONCURRENCY).contains(&concurrency) {
                return Err(AppError::InvalidArgument(format!(
                    "concurrency must be between 1 and {MAX_BACKFILL_CONCURRENCY}, got {concurrency}"
                )));
            }
            opts.concurrency = concurrency;
        }
        if let Some(min_delay_ms) = request.min_delay_ms {
            opts.min_delay = std::time::Duration::from_millis(min_delay_ms);
        }

        Ok(self.backfill.run(&opts)?)
    }

    fn find_matches(&self, id: &ItemId, k: Option<usize>) -> Result<Vec<Match>, AppError> {
        Ok(self.matcher.find_matches(id, k)?)
    }

    fn create_item(&self, item: ItemCreate) -> Result<Item, AppError> {
        let item = self.store.create(item)?;
        log::info!("item {} created", item.id);

        self.trigger.on_item_created(ItemCreated {
            item_id: item.id.clone(),
        });

        Ok(item)
    }

    fn get_item(&self, id: &ItemId) -> Result<Item, AppError> {
        self.store
            .get(id)?
            .ok_or_else(|| AppError::NotFound(format!("item {id} not found")))
    }

    fn delete_item(&self, id: &ItemId) -> Result<Item, AppError> {
        let item = self
            .store
            .delete(id)?
            .ok_or_else(|| AppError::NotFound(format!("item {id} not found")))?;
        log::info!("item {id} deleted");

        Ok(item)
    }

    fn notify_item_created(&self, id: &ItemId) -> Result<(), AppError> {
        let queued = self.trigger.on_item_created(ItemCreated {
            item_id: id.clone(),
        });

        if queued {
            Ok(())
        } else {
            Err(anyhow!("trigger listener is not running").into())
        }
    }

    fn status(&self) -> Result<CorpusStatus, AppError> {
        let model = self.updater.model();
        let mut status = CorpusStatus {
            model: model.to_string(),
            dimensions: self.updater.dimensions(),
            trigger: self.trigger.stats(),
            backfill_running: self.backfill.is_running(),
            ..Default::default()
        };

        let scan = items::scan(
            self.store.as_ref(),
            ItemFilter::All,
            self.config.backfill.page_size,
        );
        for item in scan {
            status.total += 1;
            match item?.state(model) {
                ItemState::NoText => status.no_text += 1,
                ItemState::PendingText => status.pending += 1,
                ItemState::Embedded => status.embedded += 1,
                ItemState::Stale => status.stale += 1,
            }
        }

        Ok(status)
    }
}
