//! Event waiters for integration tests

use attachment_fetch::{Event, Generation};
use std::time::Duration;
use tokio::sync::broadcast;

/// Result of waiting for a batch to finish
#[derive(Debug)]
pub enum WaitResult {
    /// Batch completed with these tallies
    Completed {
        /// Operations that succeeded
        succeeded: usize,
        /// Operations that failed
        failed: usize,
    },
    /// Batch was superseded before it finished
    Superseded,
    /// Timeout waiting for completion
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for a batch to reach a terminal state (complete or superseded)
///
/// Events for other generations are skipped.
pub async fn wait_for_batch(
    events: &mut broadcast::Receiver<Event>,
    generation: Generation,
    timeout: Duration,
) -> WaitResult {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::BatchComplete {
                    generation: g,
                    succeeded,
                    failed,
                    ..
                }) if g == generation => {
                    return WaitResult::Completed { succeeded, failed };
                }
                Ok(Event::BatchSuperseded { generation: g, .. }) if g == generation => {
                    return WaitResult::Superseded;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    match result {
        Ok(wait_result) => wait_result,
        Err(_) => WaitResult::Timeout,
    }
}

/// Collect every event until `BatchComplete` of `generation` (inclusive)
pub async fn collect_events_until_complete(
    events: &mut broadcast::Receiver<Event>,
    generation: Generation,
    timeout: Duration,
) -> Vec<Event> {
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = matches!(
                event,
                Event::BatchComplete { generation: g, .. } if g == generation
            );
            collected.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    collected
}
