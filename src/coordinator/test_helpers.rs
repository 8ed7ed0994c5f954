//! Shared test helpers: a scripted in-memory transfer engine and event waiters.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::FetchConfig;
use crate::coordinator::AttachmentFetcher;
use crate::error::{MaterializationError, TransferError};
use crate::transfer::{
    Materializer, TransferEngine, TransferEvent, TransferEventSender, TransferSession,
    TransferSubscription,
};
use crate::types::{BlobReference, Event, Generation, Record};

/// How long waiters give the coordinator before failing the test
pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// What the scripted engine does for a given attachment key
#[derive(Clone, Debug)]
pub(crate) enum Script {
    /// Keep the transfer open; the test drives it through [`Transfer`]
    Manual,
    /// Report one progress event, then complete with `size` bytes
    Succeed { size: usize },
    /// Report a transfer error
    FailTransfer,
    /// Complete, but fail to materialize the payload
    FailMaterialize,
    /// Refuse to start the transfer
    RejectFetch,
    /// End the event stream without a terminal event
    CloseStream,
    /// Panic inside `fetch`
    Panic,
    /// Start the transfer, then take `delay` before handing back the session
    SlowStart { delay: Duration },
    /// Never return from `fetch`
    HangOnStart,
}

/// Counts `stop()` calls on a transfer subscription
#[derive(Default)]
pub(crate) struct StopCounter(AtomicUsize);

impl StopCounter {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl TransferSubscription for StopCounter {
    fn stop(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// A started transfer, as seen by the test
#[derive(Clone)]
pub(crate) struct Transfer {
    pub(crate) sender: TransferEventSender,
    pub(crate) stops: Arc<StopCounter>,
}

impl Transfer {
    pub(crate) fn progress(&self, downloaded: u64, total: u64) {
        self.sender.send(TransferEvent::Progress { downloaded, total });
    }

    pub(crate) fn complete(&self, size: usize) {
        self.sender
            .send(TransferEvent::Completed(Box::new(Payload(vec![0; size]))));
    }

    pub(crate) fn fail(&self, message: &str) {
        self.sender
            .send(TransferEvent::Error(TransferError::Network(message.to_string())));
    }
}

struct Payload(Vec<u8>);

#[async_trait]
impl Materializer for Payload {
    async fn read(&self) -> Result<Vec<u8>, MaterializationError> {
        Ok(self.0.clone())
    }
}

struct BrokenPayload;

#[async_trait]
impl Materializer for BrokenPayload {
    async fn read(&self) -> Result<Vec<u8>, MaterializationError> {
        Err(MaterializationError::Corrupt("truncated payload".into()))
    }
}

/// In-memory engine whose behaviour is scripted per attachment key
///
/// Blob references look like `{"id": "<key>"}`. Unknown keys use the default
/// script.
pub(crate) struct ScriptedEngine {
    default: Script,
    scripts: Mutex<HashMap<String, Script>>,
    transfers: Mutex<HashMap<String, Transfer>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedEngine {
    pub(crate) fn new(default: Script) -> Arc<Self> {
        Arc::new(Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn script(&self, key: &str, script: Script) {
        self.scripts.lock().unwrap().insert(key.to_string(), script);
    }

    /// Number of `fetch` calls so far
    pub(crate) fn fetch_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Attachment keys passed to `fetch`, in call order
    pub(crate) fn fetched_keys(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Collections passed to `fetch`, in call order
    pub(crate) fn collections(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, collection)| collection.clone())
            .collect()
    }

    pub(crate) fn transfer(&self, key: &str) -> Option<Transfer> {
        self.transfers.lock().unwrap().get(key).cloned()
    }

    /// Wait until the engine has started a transfer for `key`
    pub(crate) async fn wait_for_transfer(&self, key: &str) -> Transfer {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(transfer) = self.transfer(key) {
                    return transfer;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("transfer for {key} never started"))
    }

    pub(crate) fn stops(&self, key: &str) -> usize {
        self.transfer(key).map_or(0, |t| t.stops.count())
    }
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    async fn fetch(
        &self,
        reference: &BlobReference,
        collection: &str,
    ) -> Result<TransferSession, TransferError> {
        let key = reference
            .token()
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.calls
            .lock()
            .unwrap()
            .push((key.clone(), collection.to_string()));

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        let stops = Arc::new(StopCounter::default());
        let (session, sender) = TransferSession::channel(stops.clone());
        let transfer = Transfer { sender, stops };

        match script {
            Script::Manual => {}
            Script::Succeed { size } => {
                transfer.progress(size as u64 / 2, size as u64);
                transfer.complete(size);
            }
            Script::FailTransfer => transfer.fail("connection reset"),
            Script::FailMaterialize => {
                transfer
                    .sender
                    .send(TransferEvent::Completed(Box::new(BrokenPayload)));
            }
            Script::RejectFetch => {
                return Err(TransferError::NotFound(key));
            }
            Script::CloseStream => {
                // Dropping every sender ends the stream
                return Ok(session);
            }
            Script::Panic => panic!("scripted engine panic for {key}"),
            Script::SlowStart { delay } => {
                self.transfers.lock().unwrap().insert(key, transfer);
                tokio::time::sleep(delay).await;
                return Ok(session);
            }
            Script::HangOnStart => return std::future::pending().await,
        }

        self.transfers.lock().unwrap().insert(key, transfer);
        Ok(session)
    }
}

/// JSON attachment token for `key`
pub(crate) fn attachment(key: &str) -> Value {
    json!({ "id": key })
}

/// A record carrying an attachment with the same key as its id
pub(crate) fn record_with_attachment(id: &str) -> Record {
    Record::new(id).with_field("content", attachment(id))
}

/// A record without an attachment
pub(crate) fn plain_record(id: &str) -> Record {
    Record::new(id).with_field("title", json!(format!("note {id}")))
}

pub(crate) fn create_test_fetcher(engine: Arc<ScriptedEngine>) -> AttachmentFetcher {
    create_test_fetcher_with(FetchConfig::default(), engine)
}

pub(crate) fn create_test_fetcher_with(
    config: FetchConfig,
    engine: Arc<ScriptedEngine>,
) -> AttachmentFetcher {
    AttachmentFetcher::new(config, engine).unwrap()
}

/// Wait for the first event matching `predicate`, discarding the others
pub(crate) async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    predicate: F,
) -> Event
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Wait for `BatchComplete` of `generation`
pub(crate) async fn wait_for_completion(
    events: &mut broadcast::Receiver<Event>,
    generation: Generation,
) -> Event {
    wait_for_event(events, |e| {
        matches!(e, Event::BatchComplete { generation: g, .. } if *g == generation)
    })
    .await
}

/// Wait until `count` `FetchStarted` events arrived for `generation`
pub(crate) async fn wait_for_started(
    events: &mut broadcast::Receiver<Event>,
    generation: Generation,
    count: usize,
) {
    for _ in 0..count {
        wait_for_event(events, |e| {
            matches!(e, Event::FetchStarted { generation: g, .. } if *g == generation)
        })
        .await;
    }
}

/// Everything currently buffered on the receiver
pub(crate) fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Generations of every `BatchComplete` in `events`
pub(crate) fn completions(events: &[Event]) -> Vec<Generation> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::BatchComplete { generation, .. } => Some(*generation),
            _ => None,
        })
        .collect()
}
