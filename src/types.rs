//! Core types for attachment-fetch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A batch generation token
///
/// Generations are strictly increasing. `Generation(0)` is the state before the
/// first snapshot and is never assigned to a batch.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// Get the inner counter value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Generation {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a single fetch operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchId(Uuid);

impl FetchId {
    /// Generate a fresh random id
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for FetchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a synced record
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A synced record: an id plus its document fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record id
    pub id: RecordId,
    /// Document fields
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a record with no fields
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Look up a field by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// One delivery from the record source: the full current record set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Every record currently in the collection
    pub records: Vec<Record>,
    /// Whether the source flagged this delivery as a change (the initial delivery is not)
    #[serde(default)]
    pub changed: bool,
}

impl RecordSnapshot {
    /// Build a snapshot flagged as a change
    pub fn changed(records: Vec<Record>) -> Self {
        Self {
            records,
            changed: true,
        }
    }
}

/// Opaque pointer to a remotely stored binary payload
///
/// The coordinator only cares whether a record has one. The wrapped value is
/// handed to the transfer engine untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobReference(Value);

impl BlobReference {
    /// Wrap an engine-specific token
    pub fn new(token: Value) -> Self {
        Self(token)
    }

    /// Borrow the engine-specific token
    pub fn token(&self) -> &Value {
        &self.0
    }
}

/// Fetch operation state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    /// Spawned, no handle yet
    Pending,
    /// Handle registered, transfer running
    InFlight,
    /// Payload fetched and materialized
    Succeeded,
    /// Transfer or materialization failed
    Failed,
    /// Generation superseded or coordinator shut down
    Cancelled,
}

impl FetchState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchState::Succeeded | FetchState::Failed | FetchState::Cancelled
        )
    }
}

/// How a fetch operation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Payload materialized
    Succeeded {
        /// Payload length
        size_bytes: u64,
    },
    /// Transfer or materialization failed
    Failed {
        /// Machine-readable error code
        code: &'static str,
        /// Error message
        error: String,
    },
    /// Superseded before finishing
    Cancelled,
}

impl FetchOutcome {
    /// Terminal state corresponding to this outcome
    pub fn state(&self) -> FetchState {
        match self {
            FetchOutcome::Succeeded { .. } => FetchState::Succeeded,
            FetchOutcome::Failed { .. } => FetchState::Failed,
            FetchOutcome::Cancelled => FetchState::Cancelled,
        }
    }
}

impl From<&crate::error::FetchError> for FetchOutcome {
    fn from(err: &crate::error::FetchError) -> Self {
        match err {
            crate::error::FetchError::StaleGeneration { .. } => FetchOutcome::Cancelled,
            other => FetchOutcome::Failed {
                code: other.code(),
                error: other.to_string(),
            },
        }
    }
}

/// Aggregate progress of the most recent batch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Batch generation (0 before the first batch)
    pub generation: Generation,
    /// Number of eligible records in the batch
    pub total: usize,
    /// Operations that succeeded
    pub succeeded: usize,
    /// Operations that failed
    pub failed: usize,
    /// Operations that settled as cancelled while the batch was current
    pub cancelled: usize,
    /// Operations currently holding a registry handle
    pub in_flight: usize,
    /// Overall completion in [0, 1]; finished operations count as 1
    pub ratio: f64,
    /// Whether the batch has completed
    pub complete: bool,
}

/// Progress of a single in-flight transfer, as reported to a progress sink
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    /// Generation of the operation
    pub generation: Generation,
    /// Operation id
    pub fetch_id: FetchId,
    /// Record whose attachment is being fetched
    pub record_id: RecordId,
    /// Bytes received so far
    pub downloaded: u64,
    /// Total bytes announced by the engine (0 = unknown)
    pub total: u64,
    /// `downloaded / total`, clamped to [0, 1]
    pub ratio: f64,
}

/// Event emitted during batch and fetch lifecycles
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A snapshot was accepted as a new batch
    BatchStarted {
        /// Batch generation
        generation: Generation,
        /// Records with a blob reference
        eligible: usize,
        /// Records without a blob reference
        skipped: usize,
        /// When the batch started
        started_at: DateTime<Utc>,
    },

    /// A fetch registered its handle and the transfer is running
    FetchStarted {
        /// Batch generation
        generation: Generation,
        /// Operation id
        fetch_id: FetchId,
        /// Record id
        record_id: RecordId,
    },

    /// Transfer progress for one fetch
    FetchProgress {
        /// Batch generation
        generation: Generation,
        /// Operation id
        fetch_id: FetchId,
        /// Progress in [0, 1]
        ratio: f64,
    },

    /// A fetch finished and its payload was materialized
    FetchSucceeded {
        /// Batch generation
        generation: Generation,
        /// Operation id
        fetch_id: FetchId,
        /// Record id
        record_id: RecordId,
        /// Payload length
        size_bytes: u64,
    },

    /// A fetch failed (the batch continues)
    FetchFailed {
        /// Batch generation
        generation: Generation,
        /// Operation id
        fetch_id: FetchId,
        /// Record id
        record_id: RecordId,
        /// Error message
        error: String,
    },

    /// A fetch was cancelled because its generation was superseded
    FetchCancelled {
        /// Batch generation
        generation: Generation,
        /// Operation id
        fetch_id: FetchId,
        /// Record id
        record_id: RecordId,
    },

    /// A batch was cancelled by a newer snapshot before it finished
    BatchSuperseded {
        /// The cancelled generation
        generation: Generation,
        /// The generation replacing it
        by: Generation,
        /// Handles that were stopped by the sweep
        stopped: usize,
    },

    /// Nothing is outstanding for this batch
    BatchComplete {
        /// Batch generation
        generation: Generation,
        /// Operations that succeeded
        succeeded: usize,
        /// Operations that failed
        failed: usize,
        /// Operations that settled as cancelled
        cancelled: usize,
        /// When the batch started
        started_at: DateTime<Utc>,
        /// When the last operation settled
        finished_at: DateTime<Utc>,
    },

    /// Coordinator shut down
    Shutdown,
}
