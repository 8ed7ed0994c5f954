//! Error types for attachment-fetch
//!
//! This module provides the error taxonomy for the coordinator:
//! - [`Error`] - top-level errors returned from public operations
//! - [`FetchError`] - per-operation terminal failures (never abort a batch)
//! - [`RegistryError`] - registry invariant violations (defensive no-ops)
//! - [`TransferError`] / [`MaterializationError`] - failures reported by the transfer engine
//!
//! Records without a blob reference are not errors at all: they are counted as
//! skipped in the [`DispatchSummary`](crate::DispatchSummary).

use std::time::Duration;
use thiserror::Error;

use crate::types::{FetchId, Generation};

/// Result type alias for attachment-fetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for attachment-fetch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent_fetches")
        key: Option<String>,
    },

    /// Shutdown in progress - not accepting new snapshots
    #[error("shutdown in progress: not accepting new snapshots")]
    ShuttingDown,

    /// A single fetch operation failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Terminal failure of a single fetch operation
///
/// These are local to their operation: the batch keeps running and its
/// completion signal still fires once nothing is outstanding.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The transfer engine refused the request or reported an error event
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// The payload arrived but could not be read back
    #[error("materialization failed: {0}")]
    Materialization(#[from] MaterializationError),

    /// The operation's generation was superseded before it finished
    #[error("generation {generation} is no longer current")]
    StaleGeneration {
        /// Generation the operation was started under
        generation: Generation,
    },

    /// The per-operation timeout elapsed while starting or running the transfer
    #[error("fetch did not finish within {after:?}")]
    Timeout {
        /// Configured timeout
        after: Duration,
    },

    /// The engine closed its event stream without a completed or error event
    #[error("transfer event stream ended without a terminal event")]
    EventStreamClosed,

    /// The registry refused the operation's handle
    #[error("registry rejected handle: {0}")]
    Registry(#[from] RegistryError),

    /// The operation task panicked before settling
    #[error("fetch task panicked: {0}")]
    Panicked(String),
}

/// Registry invariant violations
///
/// The registry never panics on these; it logs and leaves its state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A handle with this id is already registered
    #[error("fetch {id} is already registered")]
    DuplicateFetchId {
        /// The colliding fetch id
        id: FetchId,
    },

    /// The handle belongs to a generation that is no longer current
    #[error("fetch {id} belongs to stale generation {generation}")]
    StaleGeneration {
        /// The rejected fetch id
        id: FetchId,
        /// The generation the handle was tagged with
        generation: Generation,
    },

    /// The fetch id was not reserved by the open batch
    #[error("fetch {id} is not part of the open batch")]
    UnknownFetch {
        /// The rejected fetch id
        id: FetchId,
    },
}

/// Error reported by a transfer engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The referenced blob does not exist on any reachable peer
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Network or peer connectivity failure
    #[error("network error: {0}")]
    Network(String),

    /// Any other engine-specific failure
    #[error("{0}")]
    Other(String),
}

/// Error raised while reading a completed payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaterializationError {
    /// The payload could not be read from local storage
    #[error("I/O error: {0}")]
    Io(String),

    /// The payload was read but is not usable
    #[error("corrupt payload: {0}")]
    Corrupt(String),
}

impl From<std::io::Error> for MaterializationError {
    fn from(e: std::io::Error) -> Self {
        MaterializationError::Io(e.to_string())
    }
}

impl FetchError {
    /// Short machine-readable code used in events and logs
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Transfer(_) => "transfer_error",
            FetchError::Materialization(_) => "materialization_error",
            FetchError::StaleGeneration { .. } => "stale_generation",
            FetchError::Timeout { .. } => "timeout",
            FetchError::EventStreamClosed => "event_stream_closed",
            FetchError::Registry(_) => "registry_invariant_violation",
            FetchError::Panicked(_) => "panicked",
        }
    }
}
