//! Configuration types for attachment-fetch

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Coordinator configuration
///
/// Every field has a default, so `FetchConfig::default()` (or deserializing
/// `{}`) yields a working unbounded coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum number of transfers in flight at once (None = unbounded)
    ///
    /// Operations beyond the ceiling stay Pending until a permit frees up.
    /// Permits are shared across generations, so a superseded batch releases
    /// its permits as its operations observe cancellation.
    #[serde(default)]
    pub max_concurrent_fetches: Option<usize>,

    /// Per-operation timeout, in seconds on the wire (None = wait forever)
    ///
    /// Covers the engine start and the transfer itself, not the wait for a
    /// concurrency permit. An elapsed timeout fails the operation; it never
    /// retries.
    #[serde(default, with = "optional_duration_serde")]
    pub fetch_timeout: Option<Duration>,

    /// Event broadcast buffer size (default: 1000)
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Record field holding the blob reference (default: "content")
    #[serde(default = "default_attachment_field")]
    pub attachment_field: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: None,
            fetch_timeout: None,
            event_channel_capacity: default_event_channel_capacity(),
            attachment_field: default_attachment_field(),
        }
    }
}

impl FetchConfig {
    /// Check for values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_fetches == Some(0) {
            return Err(Error::Config {
                message: "max_concurrent_fetches must be at least 1 (use null for unbounded)"
                    .to_string(),
                key: Some("max_concurrent_fetches".to_string()),
            });
        }
        if self.fetch_timeout == Some(Duration::ZERO) {
            return Err(Error::Config {
                message: "fetch_timeout must be greater than zero (use null to disable)"
                    .to_string(),
                key: Some("fetch_timeout".to_string()),
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config {
                message: "event_channel_capacity must be at least 1".to_string(),
                key: Some("event_channel_capacity".to_string()),
            });
        }
        if self.attachment_field.is_empty() {
            return Err(Error::Config {
                message: "attachment_field must not be empty".to_string(),
                key: Some("attachment_field".to_string()),
            });
        }
        Ok(())
    }
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_attachment_field() -> String {
    "content".to_string()
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
