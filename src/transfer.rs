//! Transfer engine abstraction
//!
//! The coordinator never moves bytes itself. It hands a [`BlobReference`] to a
//! [`TransferEngine`] and consumes the resulting [`TransferSession`]: a
//! stop-capable subscription plus a stream of [`TransferEvent`]s.
//!
//! Engines that deliver events through callbacks on their own threads can use
//! [`TransferSession::channel`] and push events through the returned
//! [`TransferEventSender`] from any thread.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{MaterializationError, TransferError};
use crate::types::BlobReference;

/// Handle to a running transfer that can be told to stop
pub trait TransferSubscription: Send + Sync {
    /// Ask the engine to abandon the transfer
    ///
    /// Must be idempotent; the coordinator may call it from both the sweep and
    /// the operation itself.
    fn stop(&self);
}

/// Reads back a payload once the engine reports completion
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Load the payload bytes
    async fn read(&self) -> Result<Vec<u8>, MaterializationError>;
}

/// One event from a running transfer
///
/// `Completed` and `Error` are terminal. `Progress` may arrive any number of
/// times before them.
pub enum TransferEvent {
    /// Bytes received so far out of an announced total (0 = unknown)
    Progress {
        /// Bytes received
        downloaded: u64,
        /// Announced total
        total: u64,
    },
    /// Transfer finished; the payload can be materialized
    Completed(Box<dyn Materializer>),
    /// Transfer failed
    Error(TransferError),
}

impl std::fmt::Debug for TransferEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferEvent::Progress { downloaded, total } => f
                .debug_struct("Progress")
                .field("downloaded", downloaded)
                .field("total", total)
                .finish(),
            TransferEvent::Completed(_) => f.write_str("Completed(..)"),
            TransferEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// A started transfer
pub struct TransferSession {
    /// Stop handle, shared with the registry
    pub subscription: Arc<dyn TransferSubscription>,
    /// Event stream; ending without a terminal event is treated as a failure
    pub events: BoxStream<'static, TransferEvent>,
}

impl TransferSession {
    /// Build a session from an explicit event stream
    pub fn new(
        subscription: Arc<dyn TransferSubscription>,
        events: BoxStream<'static, TransferEvent>,
    ) -> Self {
        Self {
            subscription,
            events,
        }
    }

    /// Build a session fed by a channel
    ///
    /// The stream ends once every sender is dropped.
    pub fn channel(subscription: Arc<dyn TransferSubscription>) -> (Self, TransferEventSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = UnboundedReceiverStream::new(rx).boxed();

        (Self::new(subscription, events), TransferEventSender { tx })
    }
}

/// Sending half of [`TransferSession::channel`]
///
/// Sending never blocks, so it is safe to call from engine callback threads.
#[derive(Clone)]
pub struct TransferEventSender {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferEventSender {
    /// Deliver an event; returns false once the session has been dropped
    pub fn send(&self, event: TransferEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Performs byte-level downloads of blob references
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Start fetching `reference` from `collection`
    ///
    /// An `Err` here fails the operation before it registers a handle.
    async fn fetch(
        &self,
        reference: &BlobReference,
        collection: &str,
    ) -> Result<TransferSession, TransferError>;
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStop(AtomicUsize);

    impl TransferSubscription for CountingStop {
        fn stop(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Bytes(Vec<u8>);

    #[async_trait]
    impl Materializer for Bytes {
        async fn read(&self) -> Result<Vec<u8>, MaterializationError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn channel_session_delivers_events_in_order_then_ends() {
        let stop = Arc::new(CountingStop(AtomicUsize::new(0)));
        let (mut session, sender) = TransferSession::channel(stop.clone());

        assert!(sender.send(TransferEvent::Progress {
            downloaded: 1,
            total: 2
        }));
        assert!(sender.send(TransferEvent::Completed(Box::new(Bytes(vec![1, 2])))));
        drop(sender);

        match session.events.next().await {
            Some(TransferEvent::Progress { downloaded, total }) => {
                assert_eq!((downloaded, total), (1, 2));
            }
            other => panic!("expected progress, got {other:?}"),
        }
        match session.events.next().await {
            Some(TransferEvent::Completed(m)) => assert_eq!(m.read().await.unwrap(), vec![1, 2]),
            other => panic!("expected completed, got {other:?}"),
        }
        assert!(session.events.next().await.is_none());

        session.subscription.stop();
        assert_eq!(stop.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sender_reports_dropped_session() {
        let stop = Arc::new(CountingStop(AtomicUsize::new(0)));
        let (session, sender) = TransferSession::channel(stop);
        drop(session);

        assert!(!sender.send(TransferEvent::Error(TransferError::Other("late".into()))));
    }
}
