//! Record source pump and shutdown coordination.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::types::{Event, RecordSnapshot};

use super::AttachmentFetcher;

impl AttachmentFetcher {
    /// Consume a record source, dispatching every snapshot it delivers
    ///
    /// The latest record set is republished on [`records`](Self::records)
    /// before it is dispatched. Empty snapshots are dispatched too, so a
    /// collection that drops to zero attachments still reports completion.
    ///
    /// The pump ends when the stream ends or after [`shutdown`](Self::shutdown).
    pub fn start<S>(&self, collection: impl Into<String>, snapshots: S) -> JoinHandle<()>
    where
        S: Stream<Item = RecordSnapshot> + Send + 'static,
    {
        let fetcher = self.clone();
        let collection = collection.into();

        tokio::spawn(async move {
            let mut snapshots = Box::pin(snapshots);
            tracing::info!(collection = %collection, "Record source pump started");

            while let Some(snapshot) = snapshots.next().await {
                let records = Arc::new(snapshot.records);
                fetcher.records_tx.send_replace(Arc::clone(&records));

                tracing::debug!(
                    collection = %collection,
                    records = records.len(),
                    changed = snapshot.changed,
                    "Record snapshot received"
                );

                match fetcher.dispatch(records.to_vec(), &collection).await {
                    Ok(_) => {}
                    Err(Error::ShuttingDown) => {
                        tracing::debug!(
                            collection = %collection,
                            "Coordinator shut down, stopping pump"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            collection = %collection,
                            error = %e,
                            "Failed to dispatch snapshot"
                        );
                    }
                }
            }

            tracing::info!(collection = %collection, "Record source pump stopped");
        })
    }

    /// Shut the coordinator down
    ///
    /// 1. Stops accepting snapshots (`dispatch` returns [`Error::ShuttingDown`])
    /// 2. Advances the generation so every running operation is stale
    /// 3. Stops and purges the handles of the current generation
    /// 4. Emits [`Event::Shutdown`]
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let mut scope = self.scope.lock().await;
        if !self.accepting_new.swap(false, Ordering::SeqCst) {
            tracing::debug!("Shutdown already performed");
            return;
        }
        tracing::info!("Initiating shutdown");

        let (previous, generation) = self.tracker.begin_generation();
        scope.cancel.cancel();
        scope.cancel = CancellationToken::new();

        if let Some(superseded) = self.supersede(previous, generation).await {
            tracing::info!(
                generation = superseded.0,
                "Cancelled batch in progress during shutdown"
            );
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Shutdown complete");
    }

    /// Whether `dispatch` still accepts snapshots
    pub fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }
}
