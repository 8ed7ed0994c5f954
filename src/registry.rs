//! Fetch registry - bookkeeping for in-flight fetch handles
//!
//! The registry is the only shared mutable state of the coordinator. Every
//! mutation goes through one `tokio::sync::Mutex`, so completion callbacks
//! arriving from independent tasks are serialized.
//!
//! It tracks two things per batch:
//! - `handles`: one [`FetchHandle`] per operation that reached InFlight and has
//!   not settled. This is what the supersession sweep stops.
//! - the open batch ledger: every operation reserved for the current batch that
//!   has not settled yet, registered or not. The batch completes when this set
//!   drains, so an operation that finishes before a sibling registers cannot
//!   end the batch early.
//!
//! Lifecycle events (`FetchStarted`, `FetchProgress`, terminal fetch events and
//! `BatchComplete`) are emitted while the lock is held, so subscribers always
//! see a batch's fetch events before its completion.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};

use crate::error::RegistryError;
use crate::generation::GenerationTracker;
use crate::transfer::TransferSubscription;
use crate::types::{
    BatchProgress, Event, FetchId, FetchOutcome, FetchState, Generation, RecordId,
};

/// Live bookkeeping entry for one in-flight transfer
pub struct FetchHandle {
    /// Operation id
    pub fetch_id: FetchId,
    /// Record whose attachment is being fetched
    pub record_id: RecordId,
    /// Generation the operation belongs to
    pub generation: Generation,
    subscription: Arc<dyn TransferSubscription>,
}

impl FetchHandle {
    /// Create a handle around a running transfer
    pub fn new(
        fetch_id: FetchId,
        record_id: RecordId,
        generation: Generation,
        subscription: Arc<dyn TransferSubscription>,
    ) -> Self {
        Self {
            fetch_id,
            record_id,
            generation,
            subscription,
        }
    }

    /// Ask the engine to stop the transfer
    pub fn stop(&self) {
        self.subscription.stop();
    }
}

impl std::fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchHandle")
            .field("fetch_id", &self.fetch_id)
            .field("record_id", &self.record_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Result of sweeping a generation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Handles that were stopped and removed
    pub stopped: usize,
    /// Operations of the batch that had not settled (registered or not)
    pub outstanding: usize,
    /// Whether the generation still had an open batch
    pub batch_was_open: bool,
}

/// Per-batch ledger
struct BatchLedger {
    generation: Generation,
    started_at: DateTime<Utc>,
    total: usize,
    /// Reserved operations that have not settled
    outstanding: HashMap<FetchId, RecordId>,
    /// Latest progress ratio per registered operation
    ratios: HashMap<FetchId, f64>,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
}

impl BatchLedger {
    fn progress(&self, in_flight: usize) -> BatchProgress {
        let settled = self.succeeded + self.failed + self.cancelled;
        let ratio = if self.total == 0 {
            1.0
        } else {
            let partial: f64 = self.ratios.values().sum();
            ((settled as f64 + partial) / self.total as f64).clamp(0.0, 1.0)
        };

        BatchProgress {
            generation: self.generation,
            total: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            cancelled: self.cancelled,
            in_flight,
            ratio,
            complete: self.outstanding.is_empty(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<FetchId, FetchHandle>,
    batch: Option<BatchLedger>,
}

impl RegistryState {
    fn in_flight(&self, generation: Generation) -> usize {
        self.handles
            .values()
            .filter(|h| h.generation == generation)
            .count()
    }
}

/// Concurrency-safe map of live fetch handles (cloneable, all fields shared)
#[derive(Clone)]
pub struct FetchRegistry {
    state: Arc<Mutex<RegistryState>>,
    tracker: GenerationTracker,
    event_tx: broadcast::Sender<Event>,
    progress_tx: Arc<watch::Sender<BatchProgress>>,
    active_tx: Arc<watch::Sender<Option<Generation>>>,
}

impl FetchRegistry {
    /// Create an empty registry
    ///
    /// `tracker` must be the tracker the dispatcher advances; handles whose
    /// generation is not current are refused.
    pub fn new(tracker: GenerationTracker, event_tx: broadcast::Sender<Event>) -> Self {
        let (progress_tx, _) = watch::channel(BatchProgress::default());
        let (active_tx, _) = watch::channel(None);

        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            tracker,
            event_tx,
            progress_tx: Arc::new(progress_tx),
            active_tx: Arc::new(active_tx),
        }
    }

    /// Observe aggregate progress of the latest batch
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.progress_tx.subscribe()
    }

    /// Observe the generation of the batch currently in progress (None when idle)
    pub fn active_generation(&self) -> watch::Receiver<Option<Generation>> {
        self.active_tx.subscribe()
    }

    /// Open the ledger for a new batch
    ///
    /// `reserved` lists every operation the dispatcher is about to spawn. An
    /// empty list completes the batch immediately. Returns false (and opens
    /// nothing) if `generation` is no longer current.
    pub(crate) async fn open_batch(
        &self,
        generation: Generation,
        started_at: DateTime<Utc>,
        reserved: Vec<(FetchId, RecordId)>,
    ) -> bool {
        let mut state = self.state.lock().await;

        if !self.tracker.is_current(generation) {
            tracing::debug!(
                generation = generation.0,
                "Not opening batch for stale generation"
            );
            return false;
        }
        if let Some(previous) = state.batch.take() {
            tracing::warn!(
                generation = previous.generation.0,
                outstanding = previous.outstanding.len(),
                "Replacing a batch that was never swept"
            );
        }

        let ledger = BatchLedger {
            generation,
            started_at,
            total: reserved.len(),
            outstanding: reserved.into_iter().collect(),
            ratios: HashMap::new(),
            succeeded: 0,
            failed: 0,
            cancelled: 0,
        };

        if ledger.outstanding.is_empty() {
            self.finish_batch(ledger, 0);
        } else {
            self.progress_tx.send_replace(ledger.progress(0));
            self.active_tx.send_replace(Some(generation));
            state.batch = Some(ledger);
        }
        true
    }

    /// Register a handle for an operation moving Pending -> InFlight
    ///
    /// Refused (never overwritten) when the id is already present, when the
    /// handle's generation is not current, or when the id was not reserved by
    /// the open batch.
    pub async fn add(&self, handle: FetchHandle) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        let id = handle.fetch_id;
        let generation = handle.generation;

        let batch_generation = state.batch.as_ref().map(|b| b.generation);
        if !self.tracker.is_current(generation) || batch_generation != Some(generation) {
            tracing::debug!(
                fetch_id = %id,
                generation = generation.0,
                "Refusing handle from stale generation"
            );
            return Err(RegistryError::StaleGeneration { id, generation });
        }
        if state.handles.contains_key(&id) {
            tracing::warn!(fetch_id = %id, "Refusing duplicate fetch handle");
            return Err(RegistryError::DuplicateFetchId { id });
        }
        let reserved = state
            .batch
            .as_ref()
            .is_some_and(|b| b.outstanding.contains_key(&id));
        if !reserved {
            tracing::warn!(fetch_id = %id, "Refusing handle that the open batch did not reserve");
            return Err(RegistryError::UnknownFetch { id });
        }

        let record_id = handle.record_id.clone();
        state.handles.insert(id, handle);
        tracing::debug!(
            fetch_id = %id,
            record_id = %record_id,
            generation = generation.0,
            registered = state.handles.len(),
            "Fetch handle registered"
        );

        self.event_tx
            .send(Event::FetchStarted {
                generation,
                fetch_id: id,
                record_id,
            })
            .ok();
        self.publish_progress(&state);
        Ok(())
    }

    /// Record the latest progress ratio of a registered operation
    ///
    /// Returns false when the handle is gone or its batch is no longer open.
    pub async fn record_progress(&self, id: FetchId, ratio: f64) -> bool {
        let mut state = self.state.lock().await;

        let Some(generation) = state.handles.get(&id).map(|h| h.generation) else {
            return false;
        };
        let Some(batch) = state.batch.as_mut().filter(|b| b.generation == generation) else {
            return false;
        };
        batch.ratios.insert(id, ratio);

        self.event_tx
            .send(Event::FetchProgress {
                generation,
                fetch_id: id,
                ratio,
            })
            .ok();
        self.publish_progress(&state);
        true
    }

    /// Settle an operation and drop its handle
    ///
    /// Idempotent: a repeated call for an id that already settled returns false
    /// and changes nothing. When the last outstanding operation of the current
    /// batch settles, `BatchComplete` is emitted exactly once.
    ///
    /// Operations of a generation that is no longer current only lose their
    /// handle here; the supersession sweep owns the rest of their bookkeeping,
    /// so a superseded batch never reports completion.
    pub async fn remove(&self, id: FetchId, outcome: FetchOutcome) -> bool {
        let mut state = self.state.lock().await;

        let handle = state.handles.remove(&id);
        let batch_is_current = state
            .batch
            .as_ref()
            .is_some_and(|b| self.tracker.is_current(b.generation));

        let settled = match state.batch.as_mut() {
            Some(batch) if batch_is_current => batch
                .outstanding
                .remove(&id)
                .map(|record_id| (batch.generation, record_id)),
            _ => None,
        };

        let Some((generation, record_id)) = settled else {
            if handle.is_none() {
                tracing::debug!(fetch_id = %id, "Fetch already settled, ignoring");
            }
            return handle.is_some();
        };

        let mut finished = None;
        if let Some(batch) = state.batch.as_mut() {
            batch.ratios.remove(&id);
            match &outcome {
                FetchOutcome::Succeeded { .. } => batch.succeeded += 1,
                FetchOutcome::Failed { .. } => batch.failed += 1,
                FetchOutcome::Cancelled => batch.cancelled += 1,
            }
            if batch.outstanding.is_empty() {
                finished = state.batch.take();
            }
        }

        self.emit_settled(generation, id, record_id, outcome);

        match finished {
            Some(ledger) => {
                let in_flight = state.in_flight(generation);
                self.finish_batch(ledger, in_flight);
            }
            None => self.publish_progress(&state),
        }
        true
    }

    /// Stop and remove every handle tagged `generation`
    ///
    /// Does not wait for the operations' own terminal callbacks. If the
    /// generation's batch is still open it is closed without a
    /// `BatchComplete`; each unsettled operation is reported as cancelled.
    pub async fn cancel_generation(&self, generation: Generation) -> CancelReport {
        let mut state = self.state.lock().await;

        let ids: Vec<FetchId> = state
            .handles
            .values()
            .filter(|h| h.generation == generation)
            .map(|h| h.fetch_id)
            .collect();
        for id in &ids {
            if let Some(handle) = state.handles.remove(id) {
                handle.stop();
            }
        }

        let mut report = CancelReport {
            stopped: ids.len(),
            ..CancelReport::default()
        };

        if let Some(ledger) = state.batch.take_if(|b| b.generation == generation) {
            report.batch_was_open = true;
            report.outstanding = ledger.outstanding.len();
            for (fetch_id, record_id) in ledger.outstanding {
                self.event_tx
                    .send(Event::FetchCancelled {
                        generation,
                        fetch_id,
                        record_id,
                    })
                    .ok();
            }
            self.active_tx.send_replace(None);
        }

        if report.stopped > 0 || report.batch_was_open {
            tracing::info!(
                generation = generation.0,
                stopped = report.stopped,
                outstanding = report.outstanding,
                "Cancelled generation"
            );
        }
        report
    }

    /// Number of live handles
    pub async fn len(&self) -> usize {
        self.state.lock().await.handles.len()
    }

    /// Whether no handles are live
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.handles.is_empty()
    }

    /// Whether a handle with this id is live
    pub async fn contains(&self, id: FetchId) -> bool {
        self.state.lock().await.handles.contains_key(&id)
    }

    /// Where a fetch of the open batch stands
    ///
    /// `InFlight` once its handle is registered, `Pending` while it is reserved
    /// but not registered yet, `None` once it settled or was swept.
    pub async fn state_of(&self, id: FetchId) -> Option<FetchState> {
        let state = self.state.lock().await;
        if state.handles.contains_key(&id) {
            return Some(FetchState::InFlight);
        }
        state
            .batch
            .as_ref()
            .filter(|b| b.outstanding.contains_key(&id))
            .map(|_| FetchState::Pending)
    }

    /// Number of live handles tagged `generation`
    pub async fn len_for(&self, generation: Generation) -> usize {
        self.state.lock().await.in_flight(generation)
    }

    fn emit_settled(
        &self,
        generation: Generation,
        fetch_id: FetchId,
        record_id: RecordId,
        outcome: FetchOutcome,
    ) {
        let event = match outcome {
            FetchOutcome::Succeeded { size_bytes } => Event::FetchSucceeded {
                generation,
                fetch_id,
                record_id,
                size_bytes,
            },
            FetchOutcome::Failed { error, .. } => Event::FetchFailed {
                generation,
                fetch_id,
                record_id,
                error,
            },
            FetchOutcome::Cancelled => Event::FetchCancelled {
                generation,
                fetch_id,
                record_id,
            },
        };
        self.event_tx.send(event).ok();
    }

    fn finish_batch(&self, ledger: BatchLedger, in_flight: usize) {
        let finished_at = Utc::now();
        tracing::info!(
            generation = ledger.generation.0,
            total = ledger.total,
            succeeded = ledger.succeeded,
            failed = ledger.failed,
            cancelled = ledger.cancelled,
            elapsed_ms = (finished_at - ledger.started_at).num_milliseconds(),
            "Batch complete"
        );

        self.progress_tx.send_replace(ledger.progress(in_flight));
        self.active_tx.send_replace(None);
        self.event_tx
            .send(Event::BatchComplete {
                generation: ledger.generation,
                succeeded: ledger.succeeded,
                failed: ledger.failed,
                cancelled: ledger.cancelled,
                started_at: ledger.started_at,
                finished_at,
            })
            .ok();
    }

    fn publish_progress(&self, state: &RegistryState) {
        if let Some(batch) = &state.batch {
            let in_flight = state.in_flight(batch.generation);
            self.progress_tx.send_replace(batch.progress(in_flight));
        }
    }
}
