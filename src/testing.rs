//! Test doubles: in-memory transport, hand-driven timer, scripted server
//! responses, and an event recorder.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::event::{CloseEvent, Listeners, SocketEvents};
use crate::identifiers::TimerId;
use crate::protocol::handshake::{CHALLENGE_LEN, SecurityKey, header_block_len};
use crate::transport::timer::TimerCallback;
use crate::transport::{Timer, Transport, TransportEvent, TransportFactory};

// ============================================================================
// Tracing
// ============================================================================

/// Installs a test-writer subscriber honouring `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MockTransport
// ============================================================================

/// Transport that records writes; tests fire its events by hand.
pub(crate) struct MockTransport {
    listeners: Listeners<TransportEvent>,
    written: Mutex<Vec<u8>>,
    writable: AtomicBool,
    ended: AtomicBool,
    connects: Mutex<Vec<(u16, String)>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Listeners::new(),
            written: Mutex::new(Vec::new()),
            writable: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub(crate) fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock())
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub(crate) fn was_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn connects(&self) -> Vec<(u16, String)> {
        self.connects.lock().clone()
    }

    pub(crate) fn fire_connected(&self) -> Result<()> {
        self.listeners.emit(&TransportEvent::Connected)
    }

    pub(crate) fn fire_data(&self, bytes: &[u8]) -> Result<()> {
        self.listeners
            .emit(&TransportEvent::Data(Bytes::copy_from_slice(bytes)))
    }

    pub(crate) fn fire_close(&self, had_error: bool) -> Result<()> {
        self.writable.store(false, Ordering::SeqCst);
        self.listeners.emit(&TransportEvent::Close { had_error })
    }

    pub(crate) fn fire_error(&self, message: &str) -> Result<()> {
        self.listeners
            .emit(&TransportEvent::Error(Error::transport(message)))
    }

    /// Connects and answers the handshake the engine wrote.
    pub(crate) fn accept(&self, location: &str) -> Result<()> {
        self.fire_connected()?;
        let response = server_response(&self.take_written(), location);
        self.fire_data(&response)
    }
}

impl Transport for MockTransport {
    fn connect(&self, port: u16, host: &str) {
        self.connects.lock().push((port, host.to_string()));
    }

    fn write(&self, bytes: Bytes) {
        self.written.lock().extend_from_slice(&bytes);
    }

    fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn events(&self) -> &Listeners<TransportEvent> {
        &self.listeners
    }
}

/// Hands out [`MockTransport`]s and remembers them.
#[derive(Default)]
pub(crate) struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub(crate) fn last(&self) -> Arc<MockTransport> {
        let created = self.created.lock();
        Arc::clone(created.last().expect("no transport created yet"))
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        let transport = MockTransport::new();
        self.created.lock().push(Arc::clone(&transport));
        transport
    }
}

// ============================================================================
// Scripted server
// ============================================================================

/// The 16 digest bytes a conforming server sends for `request`.
pub(crate) fn response_digest(request: &[u8]) -> [u8; 16] {
    let head_len = header_block_len(request).expect("request has a header block");
    let head = std::str::from_utf8(&request[..head_len]).expect("request head is UTF-8");
    let challenge = &request[head_len..head_len + CHALLENGE_LEN];

    let key = |name: &str| {
        head.lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(SecurityKey::decode)
            .expect("request carries a decodable key")
    };

    let mut hasher = Md5::new();
    hasher.update(key("Sec-WebSocket-Key1: ").to_be_bytes());
    hasher.update(key("Sec-WebSocket-Key2: ").to_be_bytes());
    hasher.update(challenge);

    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// A response head with the given status line and headers.
pub(crate) fn response_head(status_line: &str, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut head = format!("{status_line}\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// A complete, valid server response to `request`.
pub(crate) fn server_response(request: &[u8], location: &str) -> Vec<u8> {
    let mut response = response_head(
        "HTTP/1.1 101 WebSocket Protocol Handshake",
        &[
            ("Upgrade", "WebSocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Origin", "null"),
            ("Sec-WebSocket-Location", location),
        ],
    );
    response.extend_from_slice(&response_digest(request));
    response
}

// ============================================================================
// ManualTimer
// ============================================================================

struct ScheduledTimer {
    id: TimerId,
    delay: Duration,
    callback: Option<TimerCallback>,
}

/// Timer that only fires when a test says so.
#[derive(Default)]
pub(crate) struct ManualTimer {
    scheduled: Mutex<Vec<ScheduledTimer>>,
    cancelled: Mutex<Vec<TimerId>>,
}

impl ManualTimer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delays of every timer ever scheduled, in order.
    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.scheduled.lock().iter().map(|t| t.delay).collect()
    }

    pub(crate) fn scheduled_ids(&self) -> Vec<TimerId> {
        self.scheduled.lock().iter().map(|t| t.id).collect()
    }

    pub(crate) fn cancelled(&self) -> Vec<TimerId> {
        self.cancelled.lock().clone()
    }

    /// Timers neither fired nor cancelled.
    pub(crate) fn pending(&self) -> usize {
        self.scheduled
            .lock()
            .iter()
            .filter(|t| t.callback.is_some())
            .count()
    }

    /// Fires the most recently scheduled timer. Returns `false` if it
    /// already fired or was cancelled.
    pub(crate) fn fire_last(&self) -> bool {
        let callback = self
            .scheduled
            .lock()
            .last_mut()
            .and_then(|t| t.callback.take());
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl Timer for ManualTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId> {
        let id = TimerId::next();
        self.scheduled.lock().push(ScheduledTimer {
            id,
            delay,
            callback: Some(callback),
        });
        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.cancelled.lock().push(id);
        self.scheduled
            .lock()
            .iter_mut()
            .find(|t| t.id == id)
            .and_then(|t| t.callback.take())
            .is_some()
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// One observed socket event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seen {
    Open,
    Message(String),
    Close { was_clean: bool },
    Error(String),
}

/// Records everything emitted on a [`SocketEvents`].
#[derive(Default)]
pub(crate) struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub(crate) fn attach(events: &SocketEvents) -> Arc<Self> {
        let recorder = Arc::new(Self::default());

        let r = Arc::clone(&recorder);
        events.on_open(move || {
            r.seen.lock().push(Seen::Open);
            Ok(())
        });
        let r = Arc::clone(&recorder);
        events.on_message(move |text| {
            r.seen.lock().push(Seen::Message(text.to_string()));
            Ok(())
        });
        let r = Arc::clone(&recorder);
        events.on_close(move |event: &CloseEvent| {
            r.seen.lock().push(Seen::Close {
                was_clean: event.was_clean,
            });
            Ok(())
        });
        let r = Arc::clone(&recorder);
        events.on_error(move |err| {
            r.seen.lock().push(Seen::Error(err.to_string()));
            Ok(())
        });

        recorder
    }

    pub(crate) fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.seen.lock().clear();
    }

    pub(crate) fn count(&self, wanted: &Seen) -> usize {
        self.seen.lock().iter().filter(|s| *s == wanted).count()
    }

    pub(crate) fn closes(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|s| matches!(s, Seen::Close { .. }))
            .count()
    }
}
