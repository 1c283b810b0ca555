//! Batch embedding of every item that still lacks a vector.
//!
//! The corpus is walked page by page in id order. Eligible items of a page
//! are handed to a bounded rayon pool; every provider attempt first passes a
//! shared pacer so calls start at least `min_delay` apart. This is the only
//! place that throttles or retries provider calls.
//!
//! Vectors are written to the store in memory and flushed once per page.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use rand::random_range;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::updater::{EmbeddingUpdater, UpdateOutcome};
use crate::{
    config::BackfillConfig,
    ids::ItemId,
    items::{self, ItemFilter, ItemState, ItemStore},
};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub concurrency: usize,
    pub min_delay: Duration,
    /// Total attempts per item, first try included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
    pub page_size: usize,
    /// Also re-embed items whose vector came from another model.
    pub include_stale: bool,
}

impl BackfillOptions {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: Duration::from_millis(config.jitter_ms),
            page_size: config.page_size,
            include_stale: false,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            delay
        } else {
            delay.saturating_add(Duration::from_millis(random_range(0..=jitter_ms)))
        }
    }
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self::from_config(&BackfillConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// Items handed to the updater.
    pub attempted: usize,
    pub updated: usize,
    /// Items without derivable text.
    pub skipped: usize,
    pub failed: usize,
    /// Items that already had a vector and were left alone.
    pub already_embedded: usize,
    /// Eligible items not attempted because the run was aborted.
    pub pending: usize,
    pub failed_ids: Vec<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("a backfill run is already in progress")]
    AlreadyRunning,

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Spaces out provider calls across all workers.
struct Pacer {
    min_delay: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            next_slot: Mutex::new(None),
        }
    }

    fn wait(&self) {
        if self.min_delay.is_zero() {
            return;
        }

        let wait = {
            let mut next_slot = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let start = match *next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_slot = Some(start + self.min_delay);
            start - now
        };

        if !wait.is_zero() {
            sleep(wait);
        }
    }
}

/// Shared abort flag, set by the first fatal provider error.
#[derive(Default)]
struct Abort {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl Abort {
    fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn set(&self, reason: String) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.flag.store(true, Ordering::Release);
    }

    fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

enum ItemResult {
    NotAttempted,
    Done(UpdateOutcome),
}

pub struct BackfillCoordinator {
    store: Arc<dyn ItemStore>,
    updater: Arc<EmbeddingUpdater>,
    running: AtomicBool,
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BackfillCoordinator {
    pub fn new(store: Arc<dyn ItemStore>, updater: Arc<EmbeddingUpdater>) -> Self {
        Self {
            store,
            updater,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Embeds every item that has text but no vector.
    ///
    /// Single items failing never stop the scan. A fatal provider error
    /// (bad credentials, exhausted quota) aborts the run since every further
    /// call would fail the same way.
    pub fn run(&self, opts: &BackfillOptions) -> Result<BackfillReport, BackfillError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackfillError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.concurrency.max(1))
            .thread_name(|idx| format!("backfill-{idx}"))
            .build()?;

        let started = Instant::now();
        let pacer = Pacer::new(opts.min_delay);
        let abort = Abort::default();
        let model = self.updater.model().to_string();
        let mut report = BackfillReport::default();

        log::info!(
            "backfill started (model {model}, concurrency {}, min delay {}ms)",
            opts.concurrency,
            opts.min_delay.as_millis()
        );

        let mut scan = items::scan(self.store.as_ref(), ItemFilter::All, opts.page_size);
        while let Some(page) = scan.next_page() {
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    log::error!("backfill: store query failed: {err}");
                    abort.set(format!("store query failed: {err}"));
                    break;
                }
            };

            let mut eligible = Vec::new();
            for item in page {
                match item.state(&model) {
                    ItemState::NoText => report.skipped += 1,
                    ItemState::PendingText => eligible.push(item.id),
                    ItemState::Stale if opts.include_stale => eligible.push(item.id),
                    ItemState::Embedded | ItemState::Stale => report.already_embedded += 1,
                }
            }

            // after an abort the rest of the corpus is only counted
            if abort.is_set() {
                report.pending += eligible.len();
                continue;
            }

            let results: Vec<(ItemId, ItemResult)> = pool.install(|| {
                eligible
                    .into_par_iter()
                    .map(|id| {
                        let result = self.process(&id, opts, &pacer, &abort);
                        (id, result)
                    })
                    .collect()
            });

            if let Err(err) = self.store.flush() {
                log::error!("backfill: failed to persist page: {err}");
                abort.set(format!("store flush failed: {err}"));
            }

            for (id, result) in results {
                match result {
                    ItemResult::NotAttempted => report.pending += 1,
                    ItemResult::Done(outcome) => {
                        report.attempted += 1;
                        match outcome {
                            UpdateOutcome::Updated { .. } => report.updated += 1,
                            UpdateOutcome::Skipped { .. } => report.skipped += 1,
                            UpdateOutcome::Failed { reason } => {
                                log::warn!("backfill: giving up on item {id}: {reason}");
                                report.failed += 1;
                                report.failed_ids.push(id);
                            }
                        }
                    }
                }
            }

            log::debug!(
                "backfill: {} attempted, {} updated, {} failed so far",
                report.attempted,
                report.updated,
                report.failed
            );
        }

        report.aborted = abort.reason();
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        match &report.aborted {
            Some(reason) => log::error!(
                "backfill aborted: {reason} ({} updated, {} failed, {} pending)",
                report.updated,
                report.failed,
                report.pending
            ),
            None => log::info!(
                "backfill finished in {}ms: {} attempted, {} updated, {} skipped, {} failed",
                report.elapsed_ms,
                report.attempted,
                report.updated,
                report.skipped,
                report.failed
            ),
        }

        Ok(report)
    }

    fn process(
        &self,
        id: &ItemId,
        opts: &BackfillOptions,
        pacer: &Pacer,
        abort: &Abort,
    ) -> ItemResult {
        if abort.is_set() {
            return ItemResult::NotAttempted;
        }

        let max_attempts = opts.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            pacer.wait();
            let outcome = self.updater.generate_deferred(id);

            if outcome.is_fatal_provider_error() {
                if let UpdateOutcome::Failed { reason } = &outcome {
                    abort.set(format!("fatal provider error on item {id}: {reason}"));
                }
                return ItemResult::Done(outcome);
            }

            if !outcome.is_retryable() || attempt >= max_attempts || abort.is_set() {
                return ItemResult::Done(outcome);
            }

            let delay = opts.backoff(attempt);
            log::info!(
                "backfill: item {id} failed (attempt {attempt}/{max_attempts}), retrying in {}ms",
                delay.as_millis()
            );
            sleep(delay);
            attempt += 1;
        }
    }
}
