//! Attachment fetch coordinator split into focused submodules.
//!
//! The `AttachmentFetcher` struct and its methods are organized by concern:
//! - [`dispatch`] - Snapshot intake, generation supersession, fan-out
//! - [`operation`] - Single fetch state machine (Pending -> InFlight -> terminal)
//! - [`lifecycle`] - Record source pump and shutdown

mod dispatch;
mod lifecycle;
mod operation;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use dispatch::DispatchSummary;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::error::Result;
use crate::extractor::{BlobReferenceExtractor, FieldExtractor};
use crate::generation::GenerationTracker;
use crate::progress::ProgressSink;
use crate::registry::FetchRegistry;
use crate::transfer::TransferEngine;
use crate::types::{BatchProgress, Event, FetchId, FetchState, Generation, Record};

/// Cancellation scope of the generation currently being fetched
///
/// Held behind a mutex that also serializes `dispatch` and `shutdown`, so two
/// snapshots can never interleave their advance/cancel/spawn sequences.
pub(crate) struct DispatchScope {
    pub(crate) cancel: CancellationToken,
}

/// Coordinator instance (cloneable - all fields are Arc-wrapped)
///
/// Construct one per collection you want to mirror attachments for and share
/// it by cloning. There is no global instance.
#[derive(Clone)]
pub struct AttachmentFetcher {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<FetchConfig>,
    /// Engine performing the byte-level transfers
    pub(crate) engine: Arc<dyn TransferEngine>,
    /// Decides which records carry a blob reference
    pub(crate) extractor: Arc<dyn BlobReferenceExtractor>,
    /// Current generation, shared with the registry
    pub(crate) tracker: GenerationTracker,
    /// Live handles and batch ledger
    pub(crate) registry: FetchRegistry,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Serializes dispatch/shutdown and holds the current cancellation scope
    pub(crate) scope: Arc<Mutex<DispatchScope>>,
    /// Concurrency ceiling shared by every generation (None = unbounded)
    pub(crate) limiter: Option<Arc<Semaphore>>,
    /// Optional per-transfer progress receiver
    pub(crate) progress_sink: Option<Arc<dyn ProgressSink>>,
    /// Latest record set delivered by the record source
    pub(crate) records_tx: Arc<watch::Sender<Arc<Vec<Record>>>>,
    /// Flag to indicate whether new snapshots are accepted (false after shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
}

impl AttachmentFetcher {
    /// Create a new coordinator
    ///
    /// Validates `config` and reads blob references from
    /// `config.attachment_field`. Use [`with_extractor`](Self::with_extractor)
    /// to select records differently.
    pub fn new(config: FetchConfig, engine: Arc<dyn TransferEngine>) -> Result<Self> {
        config.validate()?;

        let (event_tx, _rx) = broadcast::channel(config.event_channel_capacity);
        let tracker = GenerationTracker::new();
        let registry = FetchRegistry::new(tracker.clone(), event_tx.clone());
        let limiter = config
            .max_concurrent_fetches
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let extractor: Arc<dyn BlobReferenceExtractor> =
            Arc::new(FieldExtractor::new(config.attachment_field.clone()));
        let (records_tx, _) = watch::channel(Arc::new(Vec::new()));

        tracing::info!(
            attachment_field = %config.attachment_field,
            max_concurrent_fetches = ?config.max_concurrent_fetches,
            fetch_timeout = ?config.fetch_timeout,
            "Attachment fetcher initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            engine,
            extractor,
            tracker,
            registry,
            event_tx,
            scope: Arc::new(Mutex::new(DispatchScope {
                cancel: CancellationToken::new(),
            })),
            limiter,
            progress_sink: None,
            records_tx: Arc::new(records_tx),
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Replace the blob reference extractor
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn BlobReferenceExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Attach a progress sink receiving every accepted progress update
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// Subscribe to batch and fetch events
    ///
    /// Multiple subscribers are supported. A subscriber that falls behind by
    /// more than `event_channel_capacity` events receives `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Observe the generation of the batch in progress (None when idle)
    pub fn active_generation(&self) -> watch::Receiver<Option<Generation>> {
        self.registry.active_generation()
    }

    /// Observe aggregate progress of the latest batch
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.registry.progress()
    }

    /// Observe the latest record set delivered through [`start`](Self::start)
    pub fn records(&self) -> watch::Receiver<Arc<Vec<Record>>> {
        self.records_tx.subscribe()
    }

    /// The live generation
    pub fn current_generation(&self) -> Generation {
        self.tracker.current()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<FetchConfig> {
        Arc::clone(&self.config)
    }

    /// Number of transfers currently holding a registry handle
    pub async fn in_flight(&self) -> usize {
        self.registry.len().await
    }

    /// Whether a fetch of the current batch is still pending or already in flight
    ///
    /// `None` once it settled or its generation was superseded.
    pub async fn fetch_state(&self, fetch_id: FetchId) -> Option<FetchState> {
        self.registry.state_of(fetch_id).await
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
