use crate::mqtt::{BusClient, BusError};
use crate::store::{ReadingStore, WriteError};
use crate::telemetry::{parse_timestamp, InverterStatus, Reading};
use rumqttc::QoS;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn reading(device: &str, timestamp: &str) -> Reading {
    Reading {
        device: device.to_string(),
        timestamp: parse_timestamp(timestamp).expect("valid timestamp"),
        pro_ver: 1,
        minor_ver: 0,
        sn: 1,
        model: "X1".to_string(),
        status: InverterStatus::default(),
    }
}

pub fn payload(device: &str, timestamp: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "Device": device,
        "Timestamp": timestamp,
        "ProVer": 1,
        "MinorVer": 2,
        "SN": 1001,
        "model": "X1",
        "Status": {
            "Tyield": 100.5,
            "Pac": 500,
            "Mode": "run",
        },
    }))
    .expect("encode payload")
}

#[derive(Default)]
struct MemoryStoreInner {
    rows: Mutex<Vec<Reading>>,
    closed: AtomicBool,
    reject: AtomicBool,
    write_delay_ms: AtomicU64,
}

/// In-memory `ReadingStore` that records inserted rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<Reading> {
        self.inner.rows.lock().expect("rows lock").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn drop_connection(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn restore_connection(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    pub fn reject_rows(&self, reject: bool) {
        self.inner.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.inner
            .write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl ReadingStore for MemoryStore {
    async fn insert(&self, reading: Reading) -> Result<(), WriteError> {
        let delay_ms = self.inner.write_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        } else {
            tokio::task::yield_now().await;
        }
        if self.is_closed() {
            return Err(WriteError::ConnectionLost("pool closed".to_string()));
        }
        if self.inner.reject.load(Ordering::SeqCst) {
            return Err(WriteError::ConstraintViolation {
                code: "23505".to_string(),
                message: "duplicate key value violates unique constraint".to_string(),
            });
        }
        self.inner.rows.lock().expect("rows lock").push(reading);
        Ok(())
    }

    async fn ping(&self) -> Result<(), WriteError> {
        if self.is_closed() {
            return Err(WriteError::ConnectionLost("pool closed".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.drop_connection();
    }
}

#[derive(Default)]
struct RecordingBusInner {
    subscribes: Mutex<Vec<(String, QoS)>>,
    fail_subscribe: AtomicBool,
    disconnects: AtomicU64,
}

/// `BusClient` stub that records subscribe and disconnect calls.
#[derive(Clone, Default)]
pub struct RecordingBus {
    inner: Arc<RecordingBusInner>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribes(&self) -> Vec<(String, QoS)> {
        self.inner.subscribes.lock().expect("subscribes lock").clone()
    }

    pub fn disconnects(&self) -> u64 {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }
}

impl BusClient for RecordingBus {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), BusError> {
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BusError::Request("request channel closed".to_string()));
        }
        self.inner
            .subscribes
            .lock()
            .expect("subscribes lock")
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), BusError> {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Captures formatted log output for the current thread.
#[derive(Clone, Default)]
pub struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes WARN and above to this buffer until the guard is dropped.
    /// `#[tokio::test]` runs on the current thread, so spawned tasks are
    /// captured too.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock().expect("log lock")).into_owned()
    }

    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().expect("log lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
