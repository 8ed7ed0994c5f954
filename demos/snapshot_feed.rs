//! Feed a few record snapshots through the coordinator and print its events.
//!
//! ```bash
//! RUST_LOG=attachment_fetch=debug cargo run --example snapshot_feed
//! ```

use async_trait::async_trait;
use attachment_fetch::{
    AttachmentFetcher, BlobReference, Event, FetchConfig, MaterializationError, Materializer,
    Record, RecordSnapshot, TransferEngine, TransferError, TransferEvent, TransferSession,
    TransferSubscription,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Stop(AtomicBool);

impl TransferSubscription for Stop {
    fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Bytes(usize);

#[async_trait]
impl Materializer for Bytes {
    async fn read(&self) -> Result<Vec<u8>, MaterializationError> {
        Ok(vec![0; self.0])
    }
}

/// Pretends every blob is `size` bytes and streams it in four steps
struct SlowEngine {
    step: Duration,
}

#[async_trait]
impl TransferEngine for SlowEngine {
    async fn fetch(
        &self,
        reference: &BlobReference,
        _collection: &str,
    ) -> Result<TransferSession, TransferError> {
        let size = reference
            .token()
            .get("size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| TransferError::Other("reference without size".into()))?;

        let stop = Arc::new(Stop::default());
        let (session, sender) = TransferSession::channel(stop.clone());
        let step = self.step;

        tokio::spawn(async move {
            for quarter in 1..=4u64 {
                tokio::time::sleep(step).await;
                if stop.0.load(Ordering::SeqCst) {
                    return;
                }
                sender.send(TransferEvent::Progress {
                    downloaded: size * quarter / 4,
                    total: size,
                });
            }
            sender.send(TransferEvent::Completed(Box::new(Bytes(size as usize))));
        });

        Ok(session)
    }
}

fn note(id: &str, size: Option<u64>) -> Record {
    let record = Record::new(id).with_field("title", json!(id));
    match size {
        Some(size) => record.with_field("content", json!({ "size": size })),
        None => record,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine = Arc::new(SlowEngine {
        step: Duration::from_millis(100),
    });
    let config = FetchConfig {
        max_concurrent_fetches: Some(2),
        fetch_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let fetcher = AttachmentFetcher::new(config, engine)?;

    let mut events = fetcher.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("{}", serde_json::to_string(&event).unwrap_or_default());
            if matches!(event, Event::Shutdown) {
                break;
            }
        }
    });

    let (tx, rx) = futures::channel::mpsc::unbounded();
    let pump = fetcher.start("notes", rx);

    // Initial delivery
    tx.unbounded_send(RecordSnapshot {
        records: vec![note("a", Some(4096)), note("b", None), note("c", Some(800))],
        changed: false,
    })?;
    tokio::time::sleep(Duration::from_millis(150)).await;

    // An edit arrives while the first batch is still running
    tx.unbounded_send(RecordSnapshot::changed(vec![
        note("a", Some(4096)),
        note("d", Some(1200)),
    ]))?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Everything deleted
    tx.unbounded_send(RecordSnapshot::changed(vec![]))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    fetcher.shutdown().await;
    drop(tx);
    pump.await?;
    printer.await?;
    Ok(())
}
