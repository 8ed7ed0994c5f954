//! # attachment-fetch
//!
//! Coordinator that mirrors binary attachments of a synced record collection.
//!
//! Every time the record source delivers a new snapshot, the coordinator:
//! - cancels every transfer still running for the previous snapshot
//! - starts one transfer per record that carries a blob reference
//! - reports "batch complete" exactly once when nothing is outstanding,
//!   including immediately when no record has an attachment
//!
//! Snapshots are tagged with a monotonically increasing [`Generation`]; work
//! from a superseded generation can never touch the bookkeeping of a newer
//! one.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use attachment_fetch::{AttachmentFetcher, FetchConfig, Record, TransferEngine};
//!
//! async fn mirror(engine: Arc<dyn TransferEngine>) -> Result<(), Box<dyn std::error::Error>> {
//!     let fetcher = AttachmentFetcher::new(FetchConfig::default(), engine)?;
//!
//!     // Subscribe to events
//!     let mut events = fetcher.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let records = vec![Record::new("doc-1")];
//!     fetcher.dispatch(records, "notes").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Coordinator implementation (decomposed into focused submodules)
pub mod coordinator;
/// Error types
pub mod error;
/// Blob reference extraction
pub mod extractor;
/// Generation counter
pub mod generation;
/// Progress reporting
pub mod progress;
/// In-flight fetch bookkeeping
pub mod registry;
/// Transfer engine abstraction
pub mod transfer;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::FetchConfig;
pub use coordinator::{AttachmentFetcher, DispatchSummary};
pub use error::{Error, FetchError, MaterializationError, RegistryError, Result, TransferError};
pub use extractor::{BlobReferenceExtractor, FieldExtractor};
pub use generation::GenerationTracker;
pub use progress::{ProgressSink, progress_ratio};
pub use registry::{CancelReport, FetchHandle, FetchRegistry};
pub use transfer::{
    Materializer, TransferEngine, TransferEvent, TransferEventSender, TransferSession,
    TransferSubscription,
};
pub use types::{
    BatchProgress, BlobReference, Event, FetchId, FetchOutcome, FetchState, Generation,
    ProgressUpdate, Record, RecordId, RecordSnapshot,
};

/// Keep the coordinator running until the process is asked to terminate
///
/// Listens for SIGTERM and SIGINT on Unix and Ctrl+C elsewhere, then shuts
/// the coordinator down. A pump started with
/// [`AttachmentFetcher::start`] stops at its next snapshot.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use attachment_fetch::{AttachmentFetcher, FetchConfig, TransferEngine, run_with_shutdown};
///
/// async fn serve(engine: Arc<dyn TransferEngine>) -> Result<(), Box<dyn std::error::Error>> {
///     let fetcher = AttachmentFetcher::new(FetchConfig::default(), engine)?;
///     run_with_shutdown(fetcher).await;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(fetcher: AttachmentFetcher) {
    run_until(fetcher, termination_signal()).await;
}

/// Keep the coordinator running until `signal` resolves, then shut it down
///
/// Returns the signal's output, so callers can tell what ended the run.
pub async fn run_until<F>(fetcher: AttachmentFetcher, signal: F) -> F::Output
where
    F: std::future::Future,
{
    let output = signal.await;
    let in_flight = fetcher.in_flight().await;
    tracing::info!(
        generation = fetcher.current_generation().0,
        in_flight,
        "Stop requested, shutting down coordinator"
    );
    fetcher.shutdown().await;
    output
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    async fn first(name: &'static str, stream: &mut Signal) -> &'static str {
        stream.recv().await;
        name
    }

    // Registration can fail in sandboxes; fall back to whatever is available
    let received = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => tokio::select! {
            name = first("SIGTERM", &mut term) => name,
            name = first("SIGINT", &mut int) => name,
        },
        (Ok(mut only), Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, waiting for SIGTERM");
            first("SIGTERM", &mut only).await
        }
        (Err(e), Ok(mut only)) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT");
            first("SIGINT", &mut only).await
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "No signal handlers available, falling back to ctrl_c");
            ctrl_c().await
        }
    };
    tracing::info!(signal = received, "Termination signal received");
}

#[cfg(not(unix))]
async fn termination_signal() {
    let received = ctrl_c().await;
    tracing::info!(signal = received, "Termination signal received");
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }
    "ctrl_c"
}
