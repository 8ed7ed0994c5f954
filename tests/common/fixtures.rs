//! In-memory blob store standing in for a real transfer engine

use async_trait::async_trait;
use attachment_fetch::{
    BlobReference, MaterializationError, Materializer, Record, TransferEngine, TransferError,
    TransferEvent, TransferSession, TransferSubscription,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Size of each simulated chunk
pub const CHUNK_SIZE: usize = 1024;

/// Stop flag shared between the coordinator and a simulated transfer
#[derive(Default)]
pub struct StopFlag {
    stopped: AtomicBool,
}

impl StopFlag {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl TransferSubscription for StopFlag {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct Payload(Vec<u8>);

#[async_trait]
impl Materializer for Payload {
    async fn read(&self) -> Result<Vec<u8>, MaterializationError> {
        Ok(self.0.clone())
    }
}

/// Serves blobs from memory, one chunk per `chunk_delay`
pub struct InMemoryBlobStore {
    blobs: HashMap<String, Vec<u8>>,
    chunk_delay: Duration,
    started: AtomicUsize,
    stopped: Arc<AtomicUsize>,
}

impl InMemoryBlobStore {
    pub fn new(chunk_delay: Duration) -> Self {
        Self {
            blobs: HashMap::new(),
            chunk_delay,
            started: AtomicUsize::new(0),
            stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Store a blob of `size` bytes under `key`
    pub fn with_blob(mut self, key: &str, size: usize) -> Self {
        self.blobs.insert(key.to_string(), vec![7; size]);
        self
    }

    /// Transfers started so far
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Transfers that observed a stop request before finishing
    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferEngine for InMemoryBlobStore {
    async fn fetch(
        &self,
        reference: &BlobReference,
        _collection: &str,
    ) -> Result<TransferSession, TransferError> {
        let key = reference
            .token()
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TransferError::Other("reference without id".into()))?;
        let blob = self
            .blobs
            .get(key)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(key.to_string()))?;
        self.started.fetch_add(1, Ordering::SeqCst);

        let flag = Arc::new(StopFlag::default());
        let (session, sender) = TransferSession::channel(flag.clone());
        let delay = self.chunk_delay;
        let stopped = self.stopped.clone();

        tokio::spawn(async move {
            let total = blob.len() as u64;
            let mut downloaded = 0u64;
            for chunk in blob.chunks(CHUNK_SIZE) {
                tokio::time::sleep(delay).await;
                if flag.is_stopped() {
                    stopped.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                downloaded += chunk.len() as u64;
                sender.send(TransferEvent::Progress { downloaded, total });
            }
            sender.send(TransferEvent::Completed(Box::new(Payload(blob))));
        });

        Ok(session)
    }
}

/// A note record, with an attachment token when `blob` is set
pub fn note(id: &str, blob: Option<&str>) -> Record {
    let record = Record::new(id).with_field("title", json!(format!("note {id}")));
    match blob {
        Some(key) => record.with_field("content", json!({ "id": key })),
        None => record,
    }
}
