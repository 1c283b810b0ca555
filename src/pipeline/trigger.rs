//! "Item created" event intake.
//!
//! Events are queued and handled off the caller's thread, so creating an
//! item never waits on the embedding provider. Failures are logged and not
//! retried here; backfill picks the item up later.

use std::{
    sync::{
        atomic::{AtomicU16, AtomicU64, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{sleep, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::updater::{EmbeddingUpdater, FailureReason, UpdateOutcome};
use crate::ids::ItemId;

/// Payload of one at-least-once "item created" delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCreated {
    pub item_id: ItemId,
}

#[derive(Debug)]
enum Task {
    ItemCreated(ItemCreated),

    /// drain in-flight work, then stop the dispatcher
    Shutdown,
}

#[derive(Debug, Default)]
pub struct TriggerStats {
    pub received: AtomicU64,
    pub updated: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStatsSnapshot {
    pub received: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TriggerStats {
    pub fn snapshot(&self) -> TriggerStatsSnapshot {
        TriggerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &UpdateOutcome) {
        let counter = match outcome {
            UpdateOutcome::Updated { .. } => &self.updated,
            UpdateOutcome::Skipped { .. } => &self.skipped,
            UpdateOutcome::Failed { .. } => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct TriggerListener {
    task_tx: mpsc::Sender<Task>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<TriggerStats>,
}

impl TriggerListener {
    /// Starts the dispatcher thread.
    pub fn start(updater: Arc<EmbeddingUpdater>, max_threads: u16) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<Task>();
        let stats = Arc::new(TriggerStats::default());

        let dispatcher = std::thread::Builder::new()
            .name("trigger-dispatch".to_string())
            .spawn({
                let stats = stats.clone();
                move || dispatch(task_rx, updater, stats, max_threads.max(1))
            })
            .map_err(|err| log::error!("failed to spawn trigger dispatcher: {err}"))
            .ok();

        Self {
            task_tx,
            dispatcher: Mutex::new(dispatcher),
            stats,
        }
    }

    /// Queues the event and returns immediately.
    ///
    /// Returns `false` when the listener is shut down; the item then waits
    /// for the next backfill.
    pub fn on_item_created(&self, event: ItemCreated) -> bool {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let item_id = event.item_id.clone();
        match self.task_tx.send(Task::ItemCreated(event)) {
            Ok(()) => true,
            Err(_) => {
                log::error!("trigger listener stopped; item {item_id} left for backfill");
                false
            }
        }
    }

    pub fn stats(&self) -> TriggerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Waits for every queued and running event, then stops the dispatcher.
    pub fn shutdown(&self) {
        let handle = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        let Some(handle) = handle else {
            return;
        };

        let _ = self.task_tx.send(Task::Shutdown);
        log::info!("waiting for trigger workers to finish");
        if handle.join().is_err() {
            log::error!("trigger dispatcher panicked");
        }
    }
}

impl Drop for TriggerListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements the in-flight counter even if the worker panics.
struct SlotGuard(Arc<AtomicU16>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn acquire_slot(in_flight: &Arc<AtomicU16>, max_threads: u16) -> SlotGuard {
    loop {
        let current = in_flight.load(Ordering::Acquire);
        if current < max_threads
            && in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return SlotGuard(in_flight.clone());
        }
        sleep(Duration::from_millis(10));
    }
}

fn dispatch(
    task_rx: mpsc::Receiver<Task>,
    updater: Arc<EmbeddingUpdater>,
    stats: Arc<TriggerStats>,
    max_threads: u16,
) {
    let in_flight = Arc::new(AtomicU16::new(0));

    log::debug!("trigger dispatcher waiting for events");
    while let Ok(task) = task_rx.recv() {
        let event = match task {
            Task::ItemCreated(event) => event,
            Task::Shutdown => break,
        };

        let slot = acquire_slot(&in_flight, max_threads);
        let updater = updater.clone();
        let stats = stats.clone();

        let spawned = std::thread::Builder::new()
            .name("trigger-worker".to_string())
            .spawn(move || {
                let _slot = slot;
                let outcome = updater.generate(&event.item_id);
                log_outcome(&event.item_id, &outcome);
                stats.record(&outcome);
            });

        if let Err(err) = spawned {
            log::error!("failed to spawn trigger worker: {err}");
        }
    }

    while in_flight.load(Ordering::Acquire) > 0 {
        sleep(Duration::from_millis(20));
    }
    log::debug!("trigger dispatcher stopped");
}

fn log_outcome(id: &ItemId, outcome: &UpdateOutcome) {
    match outcome {
        UpdateOutcome::Updated { .. } => log::debug!("trigger: item {id} embedded"),
        UpdateOutcome::Skipped { .. } => log::debug!("trigger: item {id} has no text, skipped"),
        UpdateOutcome::Failed { reason } if outcome.is_retryable() => {
            log::warn!("trigger: embedding failed for {id}, left for backfill: {reason}")
        }
        UpdateOutcome::Failed { reason } if outcome.is_fatal_provider_error() => {
            log::error!("trigger: embedding provider rejected request for {id}, check provider configuration: {reason}")
        }
        UpdateOutcome::Failed {
            reason: FailureReason::NotFound,
        } => log::warn!("trigger: item {id} no longer exists"),
        UpdateOutcome::Failed { reason } => {
            log::error!("trigger: embedding generation failed for {id}: {reason}")
        }
    }
}
