//! Snapshot dispatch - supersede the previous generation, fan out new fetches.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::extractor::{Eligible, select_eligible};
use crate::registry::FetchRegistry;
use crate::types::{Event, FetchId, FetchOutcome, FetchState, Generation, Record};

use super::AttachmentFetcher;
use super::operation::{FetchOperation, OperationContext, run_fetch_operation};

/// What a single `dispatch` call did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Generation assigned to the snapshot
    pub generation: Generation,
    /// Records with a blob reference (one fetch each)
    pub eligible: usize,
    /// Records without a blob reference
    pub skipped: usize,
    /// Previous generation, if it still had an open batch when superseded
    pub superseded: Option<Generation>,
}

impl AttachmentFetcher {
    /// Start fetching attachments for a new record snapshot
    ///
    /// Sequence, strictly in this order:
    /// 1. Advance to a new generation
    /// 2. Cancel the previous generation: stop its transfers and purge its
    ///    handles without waiting for their callbacks
    /// 3. Select records carrying a blob reference (the rest are skipped)
    /// 4. With nothing eligible, emit `BatchComplete` before returning
    /// 5. Otherwise spawn one fetch per eligible record under a supervisor
    ///
    /// Concurrent calls are serialized; each fully supersedes the one before.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after [`shutdown`](Self::shutdown).
    pub async fn dispatch(
        &self,
        records: Vec<Record>,
        collection: &str,
    ) -> Result<DispatchSummary> {
        let mut scope = self.scope.lock().await;
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        // 1. Advance before cancelling, so stale operations fail their generation check
        let (previous, generation) = self.tracker.begin_generation();

        // 2. Cancel the previous generation
        scope.cancel.cancel();
        let superseded = self.supersede(previous, generation).await;

        // 3. Select eligible records
        let Eligible { items, skipped } = select_eligible(self.extractor.as_ref(), records);
        let operations: Vec<FetchOperation> = items
            .into_iter()
            .map(|(record, reference)| FetchOperation {
                fetch_id: FetchId::new(),
                record_id: record.id,
                reference,
                generation,
            })
            .collect();

        let started_at = Utc::now();
        let summary = DispatchSummary {
            generation,
            eligible: operations.len(),
            skipped,
            superseded,
        };
        tracing::info!(
            generation = generation.0,
            collection,
            eligible = summary.eligible,
            skipped,
            "Starting attachment fetch batch"
        );
        self.emit_event(Event::BatchStarted {
            generation,
            eligible: summary.eligible,
            skipped,
            started_at,
        });

        // 4. An empty reservation list completes the batch right here
        let reserved = operations
            .iter()
            .map(|op| (op.fetch_id, op.record_id.clone()))
            .collect();
        let opened = self
            .registry
            .open_batch(generation, started_at, reserved)
            .await;
        if !opened {
            tracing::warn!(
                generation = generation.0,
                "Registry refused to open the batch, generation is no longer current"
            );
        }

        let cancel = CancellationToken::new();
        scope.cancel = cancel.clone();

        // 5. Fan out
        if !operations.is_empty() {
            let ctx = Arc::new(OperationContext {
                engine: Arc::clone(&self.engine),
                registry: self.registry.clone(),
                tracker: self.tracker.clone(),
                collection: Arc::from(collection),
                cancel,
                limiter: self.limiter.clone(),
                timeout: self.config.fetch_timeout,
                progress_sink: self.progress_sink.clone(),
            });
            spawn_supervisor(generation, operations, ctx);
        }

        Ok(summary)
    }

    /// Cancel `previous` and report it if its batch was still open
    pub(crate) async fn supersede(
        &self,
        previous: Generation,
        by: Generation,
    ) -> Option<Generation> {
        let report = self.registry.cancel_generation(previous).await;
        if !report.batch_was_open {
            return None;
        }

        self.emit_event(Event::BatchSuperseded {
            generation: previous,
            by,
            stopped: report.stopped,
        });
        Some(previous)
    }
}

/// Spawn the supervising task for one generation
///
/// Each operation runs as its own task inside a `JoinSet`. A panicking
/// operation is settled as failed so the batch can still complete. Once every
/// task has joined, the terminal states are tallied for the log.
fn spawn_supervisor(
    generation: Generation,
    operations: Vec<FetchOperation>,
    ctx: Arc<OperationContext>,
) {
    tokio::spawn(async move {
        let mut set = JoinSet::new();
        let count = operations.len();

        for op in operations {
            let fetch_id = op.fetch_id;
            let ctx = Arc::clone(&ctx);
            set.spawn(async move {
                let registry = ctx.registry.clone();
                let result = AssertUnwindSafe(run_fetch_operation(op, ctx))
                    .catch_unwind()
                    .await;
                match result {
                    Ok(state) => state,
                    Err(panic) => {
                        settle_panicked(&registry, fetch_id, panic_message(panic.as_ref())).await;
                        FetchState::Failed
                    }
                }
            });
        }

        let mut tally = StateTally::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(state) => tally.record(state),
                Err(e) => {
                    tracing::error!(generation = generation.0, error = %e, "Fetch task aborted");
                    tally.record(FetchState::Failed);
                }
            }
        }
        tracing::debug!(
            generation = generation.0,
            operations = count,
            succeeded = tally.succeeded,
            failed = tally.failed,
            cancelled = tally.cancelled,
            "All fetch tasks for generation joined"
        );
    });
}

/// Terminal states reached by the operations of one generation
#[derive(Debug, Default, PartialEq, Eq)]
struct StateTally {
    succeeded: usize,
    failed: usize,
    cancelled: usize,
}

impl StateTally {
    fn record(&mut self, state: FetchState) {
        match state {
            FetchState::Succeeded => self.succeeded += 1,
            FetchState::Failed => self.failed += 1,
            FetchState::Cancelled => self.cancelled += 1,
            FetchState::Pending | FetchState::InFlight => {
                tracing::warn!(state = ?state, "Fetch task ended without a terminal state");
            }
        }
    }
}

async fn settle_panicked(registry: &FetchRegistry, fetch_id: FetchId, message: String) {
    tracing::error!(fetch_id = %fetch_id, panic = %message, "Fetch task panicked");
    let error = crate::error::FetchError::Panicked(message);
    registry
        .remove(
            fetch_id,
            FetchOutcome::Failed {
                code: error.code(),
                error: error.to_string(),
            },
        )
        .await;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
