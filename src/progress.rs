//! Progress ratio calculation and progress sinks

use crate::types::ProgressUpdate;

/// Fraction of a transfer that has arrived
///
/// Always in `[0, 1]`. An unknown total (`0`) yields `0`, and a `downloaded`
/// value past the announced total clamps to `1`.
pub fn progress_ratio(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (downloaded as f64 / total as f64).clamp(0.0, 1.0)
}

/// Receives per-transfer progress updates
///
/// Called from fetch operation tasks, so implementations must not block.
pub trait ProgressSink: Send + Sync {
    /// Handle one update
    fn report(&self, update: &ProgressUpdate);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) {
        self(update)
    }
}
