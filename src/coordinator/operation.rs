//! Fetch operation - drives one blob transfer to a terminal state.
//!
//! ```text
//! Pending --(permit, engine.fetch, registry.add)--> InFlight --+--> Succeeded
//!    |                                                          +--> Failed
//!    +----------------------------------------------------------+--> Cancelled
//! ```
//!
//! The generation is checked at every registration and terminal point and
//! the cancellation scope is raced against every wait except the engine start,
//! which always runs to completion so its transfer can be stopped. The optional
//! timeout covers everything after the permit. Whatever happens, the operation
//! settles exactly once through the registry.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{FetchError, RegistryError};
use crate::generation::GenerationTracker;
use crate::progress::{ProgressSink, progress_ratio};
use crate::registry::{FetchHandle, FetchRegistry};
use crate::transfer::{TransferEngine, TransferEvent, TransferSession, TransferSubscription};
use crate::types::{
    BlobReference, FetchId, FetchOutcome, FetchState, Generation, ProgressUpdate, RecordId,
};

/// One record's fetch, as planned by the dispatcher
pub(crate) struct FetchOperation {
    pub(crate) fetch_id: FetchId,
    pub(crate) record_id: RecordId,
    pub(crate) reference: BlobReference,
    pub(crate) generation: Generation,
}

/// State shared by every operation of one generation
pub(crate) struct OperationContext {
    pub(crate) engine: Arc<dyn TransferEngine>,
    pub(crate) registry: FetchRegistry,
    pub(crate) tracker: GenerationTracker,
    pub(crate) collection: Arc<str>,
    pub(crate) cancel: CancellationToken,
    pub(crate) limiter: Option<Arc<Semaphore>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) progress_sink: Option<Arc<dyn ProgressSink>>,
}

impl OperationContext {
    fn is_live(&self, generation: Generation) -> bool {
        !self.cancel.is_cancelled() && self.tracker.is_current(generation)
    }
}

fn stale(generation: Generation) -> FetchError {
    FetchError::StaleGeneration { generation }
}

/// Run one operation to completion and settle it in the registry
pub(crate) async fn run_fetch_operation(
    op: FetchOperation,
    ctx: Arc<OperationContext>,
) -> FetchState {
    let result = drive(&op, &ctx).await;

    let outcome = match &result {
        _ if !ctx.tracker.is_current(op.generation) => FetchOutcome::Cancelled,
        Ok(size_bytes) => FetchOutcome::Succeeded {
            size_bytes: *size_bytes,
        },
        Err(e) => FetchOutcome::from(e),
    };

    match (&result, &outcome) {
        (_, FetchOutcome::Cancelled) => tracing::debug!(
            fetch_id = %op.fetch_id,
            record_id = %op.record_id,
            generation = op.generation.0,
            "Fetch cancelled"
        ),
        (Ok(size_bytes), _) => tracing::debug!(
            fetch_id = %op.fetch_id,
            record_id = %op.record_id,
            generation = op.generation.0,
            size_bytes,
            "Fetch succeeded"
        ),
        (Err(e), _) => tracing::warn!(
            fetch_id = %op.fetch_id,
            record_id = %op.record_id,
            generation = op.generation.0,
            code = e.code(),
            error = %e,
            "Fetch failed"
        ),
    }

    let state = outcome.state();
    ctx.registry.remove(op.fetch_id, outcome).await;
    state
}

/// Pending -> InFlight -> terminal; returns the payload size on success
async fn drive(op: &FetchOperation, ctx: &OperationContext) -> Result<u64, FetchError> {
    // Pending: wait for a concurrency permit if a ceiling is configured
    let _permit = match &ctx.limiter {
        Some(limiter) => {
            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(stale(op.generation)),
                permit = Arc::clone(limiter).acquire_owned() => permit,
            };
            // A closed semaphore means the coordinator is going away
            Some(permit.map_err(|_| stale(op.generation))?)
        }
        None => None,
    };

    if !ctx.is_live(op.generation) {
        return Err(stale(op.generation));
    }

    // Set once the engine has started the transfer
    let mut started: Option<Arc<dyn TransferSubscription>> = None;
    let result = match ctx.timeout {
        Some(after) => {
            match tokio::time::timeout(after, in_flight(op, ctx, &mut started)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout { after }),
            }
        }
        None => in_flight(op, ctx, &mut started).await,
    };

    // The engine already finished on its own for transfer/materialization outcomes
    let abandoned = matches!(
        result,
        Err(FetchError::StaleGeneration { .. }
            | FetchError::Timeout { .. }
            | FetchError::EventStreamClosed
            | FetchError::Registry(_))
    );
    if let (true, Some(subscription)) = (abandoned, &started) {
        subscription.stop();
    }
    result
}

/// Start the transfer, register its handle and wait for the terminal event
///
/// The engine start is never abandoned midway: a transfer that comes up after
/// its generation ended is handed back through `started` so it can be stopped.
async fn in_flight(
    op: &FetchOperation,
    ctx: &OperationContext,
    started: &mut Option<Arc<dyn TransferSubscription>>,
) -> Result<u64, FetchError> {
    let TransferSession {
        subscription,
        mut events,
    } = ctx.engine.fetch(&op.reference, &ctx.collection).await?;
    *started = Some(Arc::clone(&subscription));

    if !ctx.is_live(op.generation) {
        return Err(stale(op.generation));
    }

    // Pending -> InFlight
    let handle = FetchHandle::new(
        op.fetch_id,
        op.record_id.clone(),
        op.generation,
        subscription,
    );
    if let Err(e) = ctx.registry.add(handle).await {
        return Err(match e {
            RegistryError::StaleGeneration { generation, .. } => stale(generation),
            other => FetchError::Registry(other),
        });
    }

    await_terminal(op, ctx, &mut events).await
}

/// Consume transfer events until a terminal one arrives
async fn await_terminal(
    op: &FetchOperation,
    ctx: &OperationContext,
    events: &mut BoxStream<'static, TransferEvent>,
) -> Result<u64, FetchError> {
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(stale(op.generation)),
            event = events.next() => event,
        };

        match event {
            Some(TransferEvent::Progress { downloaded, total }) => {
                if !ctx.is_live(op.generation) {
                    return Err(stale(op.generation));
                }
                let ratio = progress_ratio(downloaded, total);
                let accepted = ctx.registry.record_progress(op.fetch_id, ratio).await;
                if let (true, Some(sink)) = (accepted, &ctx.progress_sink) {
                    sink.report(&ProgressUpdate {
                        generation: op.generation,
                        fetch_id: op.fetch_id,
                        record_id: op.record_id.clone(),
                        downloaded,
                        total,
                        ratio,
                    });
                }
            }
            Some(TransferEvent::Completed(materializer)) => {
                if !ctx.is_live(op.generation) {
                    return Err(stale(op.generation));
                }
                let payload = materializer.read().await?;
                return Ok(payload.len() as u64);
            }
            Some(TransferEvent::Error(e)) => return Err(FetchError::Transfer(e)),
            None => return Err(FetchError::EventStreamClosed),
        }
    }
}
