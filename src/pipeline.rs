use crate::store::{ReadingStore, WriteError};
use crate::telemetry::{decode_reading, DecodeError};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

/// What happened to one inbound message. Every variant other than
/// `Persisted` means the message was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Persisted,
    DecodeFailed(DecodeError),
    WriteFailed(WriteError),
}

#[derive(Clone)]
pub struct Ingestor<S> {
    store: S,
    stats: Arc<IngestStats>,
}

impl<S: ReadingStore> Ingestor<S> {
    pub fn new(store: S, stats: Arc<IngestStats>) -> Self {
        Self { store, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Decodes one payload and writes it as a single row. Failures are logged
    /// and reported in the outcome; nothing here is retried.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(topic, bytes = payload.len(), "received message");
        tracing::trace!(topic, payload = %String::from_utf8_lossy(payload), "message payload");

        let reading = match decode_reading(payload) {
            Ok(reading) => reading,
            Err(err) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::warn!(
                    error = %err,
                    kind = err.kind(),
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping undecodable message"
                );
                return MessageOutcome::DecodeFailed(err);
            }
        };

        let device = reading.device.clone();
        let timestamp = reading.timestamp;
        match self.store.insert(reading).await {
            Ok(()) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(device = %device, %timestamp, "reading persisted");
                MessageOutcome::Persisted
            }
            Err(err) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::warn!(
                    error = %err,
                    kind = err.kind(),
                    device = %device,
                    %timestamp,
                    "dropping reading after failed insert"
                );
                MessageOutcome::WriteFailed(err)
            }
        }
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub persisted: AtomicU64,
    pub decode_failures: AtomicU64,
    pub write_failures: AtomicU64,
    pub subscriptions: AtomicU64,
    pub bus_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSnapshot {
    pub received: u64,
    pub persisted: u64,
    pub decode_failures: u64,
    pub write_failures: u64,
    pub subscriptions: u64,
    pub bus_connected: bool,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
            bus_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            bus_connected: self.bus_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}
