//! tokio TCP transport.
//!
//! Each connect attempt spawns one task that owns the `TcpStream`.
//!
//! # Event Loop
//!
//! The task handles:
//!
//! - Reading into a `BytesMut` buffer and emitting `Data` in arrival order
//! - Writes and half-close commands from the protocol engine
//! - Emitting `Error` then `Close { had_error: true }` on failure, or
//!   `Close { had_error: false }` when the peer closes

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::event::Listeners;

use super::{Transport, TransportEvent, TransportFactory};

// ============================================================================
// Constants
// ============================================================================

/// Default read buffer capacity.
const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// TcpOptions
// ============================================================================

/// TCP socket options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOptions {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,

    /// Read buffer capacity in bytes.
    pub read_buffer_size: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpOptions {
    /// Creates options with `nodelay` on and an 8 KiB read buffer.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Sets `TCP_NODELAY`.
    #[inline]
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets the read buffer capacity.
    #[inline]
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

// ============================================================================
// TcpTransportFactory
// ============================================================================

/// Creates [`TcpTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    options: TcpOptions,
}

impl TcpTransportFactory {
    /// Creates a factory with the given options.
    #[inline]
    #[must_use]
    pub fn new(options: TcpOptions) -> Self {
        Self { options }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self) -> Arc<dyn Transport> {
        Arc::new(TcpTransport::new(self.options.clone()))
    }
}

// ============================================================================
// TransportCommand
// ============================================================================

/// Internal commands for the event loop.
enum TransportCommand {
    /// Write bytes to the stream.
    Write(Bytes),
    /// Shut down the write half.
    End,
}

// ============================================================================
// TcpTransport
// ============================================================================

/// Plaintext TCP transport driven by a tokio task.
///
/// The runtime is looked up when [`connect`](Transport::connect) is called.
/// Dropping the transport closes the command channel, which stops the task
/// and closes the stream.
pub struct TcpTransport {
    shared: Arc<Shared>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<TransportCommand>>>,
}

/// State shared with the event loop.
struct Shared {
    options: TcpOptions,
    listeners: Listeners<TransportEvent>,
    writable: AtomicBool,
}

impl TcpTransport {
    /// Creates an unconnected transport.
    #[must_use]
    pub fn new(options: TcpOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                listeners: Listeners::new(),
                writable: AtomicBool::new(false),
            }),
            command_tx: Mutex::new(None),
        }
    }

    fn send_command(&self, command: TransportCommand) {
        let guard = self.command_tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(command).is_err() {
                    debug!("Transport event loop already terminated");
                }
            }
            None => warn!("Transport used before connect"),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&self, port: u16, host: &str) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "No tokio runtime for TCP transport");
                self.shared
                    .emit(&TransportEvent::Error(Error::transport(format!(
                        "no tokio runtime: {e}"
                    ))));
                self.shared
                    .emit(&TransportEvent::Close { had_error: true });
                return;
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock() = Some(command_tx);

        let shared = Arc::clone(&self.shared);
        let host = host.to_string();
        handle.spawn(async move {
            shared.run_event_loop(host, port, command_rx).await;
        });
    }

    fn write(&self, bytes: Bytes) {
        trace!(len = bytes.len(), "Queueing write");
        self.send_command(TransportCommand::Write(bytes));
    }

    fn end(&self) {
        self.shared.writable.store(false, Ordering::SeqCst);
        self.send_command(TransportCommand::End);
    }

    fn is_writable(&self) -> bool {
        self.shared.writable.load(Ordering::SeqCst)
    }

    fn events(&self) -> &Listeners<TransportEvent> {
        &self.shared.listeners
    }
}

impl Shared {
    /// Emits an event; a failing error listener is logged here.
    fn emit(&self, event: &TransportEvent) {
        if let Err(e) = self.listeners.emit(event) {
            error!(error = %e, "Error listener failed");
        }
    }

    /// Event loop that owns the TCP stream.
    async fn run_event_loop(
        self: Arc<Self>,
        host: String,
        port: u16,
        mut command_rx: mpsc::UnboundedReceiver<TransportCommand>,
    ) {
        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%host, port, error = %e, "TCP connect failed");
                self.emit(&TransportEvent::Error(e.into()));
                self.emit(&TransportEvent::Close { had_error: true });
                return;
            }
        };

        if self.options.nodelay
            && let Err(e) = stream.set_nodelay(true)
        {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(%host, port, "TCP connection established");
        self.writable.store(true, Ordering::SeqCst);
        self.emit(&TransportEvent::Connected);

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = BytesMut::with_capacity(self.options.read_buffer_size);
        let mut write_open = true;

        let had_error = loop {
            tokio::select! {
                // Incoming bytes
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(%host, port, "TCP stream closed by peer");
                            break false;
                        }
                        Ok(n) => {
                            trace!(n, "Read bytes");
                            let chunk = buf.split().freeze();
                            self.emit(&TransportEvent::Data(chunk));
                            buf.reserve(self.options.read_buffer_size);
                        }
                        Err(e) => {
                            warn!(error = %e, "TCP read failed");
                            self.emit(&TransportEvent::Error(e.into()));
                            break true;
                        }
                    }
                }

                // Commands from the engine
                command = command_rx.recv() => {
                    match command {
                        Some(TransportCommand::Write(bytes)) if !write_open => {
                            debug!(len = bytes.len(), "Dropping write after half-close");
                        }

                        Some(TransportCommand::Write(bytes)) => {
                            if let Err(e) = writer.write_all(&bytes).await {
                                warn!(error = %e, "TCP write failed");
                                self.emit(&TransportEvent::Error(e.into()));
                                break true;
                            }
                        }

                        Some(TransportCommand::End) if !write_open => {}

                        Some(TransportCommand::End) => {
                            debug!("Half-closing TCP stream");
                            if let Err(e) = writer.shutdown().await {
                                debug!(error = %e, "TCP shutdown failed");
                            }
                            write_open = false;
                        }

                        // Owner dropped the transport
                        None => {
                            debug!(%host, port, "Transport dropped, closing stream");
                            break false;
                        }
                    }
                }
            }
        };

        self.writable.store(false, Ordering::SeqCst);
        self.emit(&TransportEvent::Close { had_error });

        debug!(%host, port, "Transport event loop terminated");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn describe(event: &TransportEvent) -> String {
        match event {
            TransportEvent::Connected => "connected".into(),
            TransportEvent::Data(bytes) => format!("data:{}", String::from_utf8_lossy(bytes)),
            TransportEvent::Error(_) => "error".into(),
            TransportEvent::Close { had_error } => format!("close:{had_error}"),
        }
    }

    #[test]
    fn test_options_builder() {
        let options = TcpOptions::new()
            .with_nodelay(false)
            .with_read_buffer_size(0);
        assert!(!options.nodelay);
        assert_eq!(options.read_buffer_size, 1);
        assert_eq!(TcpOptions::default().read_buffer_size, 8 * 1024);
    }

    #[test]
    fn test_connect_without_runtime_reports_failure() {
        let transport = TcpTransport::new(TcpOptions::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        transport.events().add(move |event| {
            sink.lock().push(describe(event));
            Ok(())
        });

        transport.connect(80, "localhost");
        assert_eq!(*seen.lock(), vec!["error", "close:true"]);
        assert!(!transport.is_writable());
    }

    #[tokio::test]
    async fn test_round_trip_and_half_close() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await?;
            stream.write_all(b"pong").await?;
            anyhow::Ok(received)
        });

        let transport = Arc::new(TcpTransport::new(TcpOptions::default()));
        let (tx, mut rx) = unbounded_channel();
        let writer = Arc::clone(&transport);
        transport.events().add(move |event| {
            if matches!(event, TransportEvent::Connected) {
                writer.write(Bytes::from_static(b"ping"));
                writer.end();
            }
            let _ = tx.send(describe(event));
            Ok(())
        });
        transport.connect(port, "127.0.0.1");

        let mut seen = Vec::new();
        while let Some(event) = timeout(WAIT, rx.recv()).await? {
            let done = event.starts_with("close");
            seen.push(event);
            if done {
                break;
            }
        }

        assert_eq!(server.await??, b"ping".to_vec());
        assert_eq!(seen.first().map(String::as_str), Some("connected"));
        assert_eq!(seen.last().map(String::as_str), Some("close:false"));
        let data: String = seen
            .iter()
            .filter_map(|e| e.strip_prefix("data:"))
            .collect();
        assert_eq!(data, "pong");
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_closes_stream() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            let mut received = Vec::new();
            timeout(WAIT, stream.read_to_end(&mut received)).await??;
            anyhow::Ok(received)
        });

        let transport = TcpTransport::new(TcpOptions::default());
        let (tx, mut rx) = unbounded_channel();
        transport.events().add(move |event| {
            let _ = tx.send(describe(event));
            Ok(())
        });
        transport.connect(port, "127.0.0.1");
        assert_eq!(timeout(WAIT, rx.recv()).await?.as_deref(), Some("connected"));

        drop(transport);
        assert_eq!(timeout(WAIT, rx.recv()).await?.as_deref(), Some("close:false"));
        assert!(server.await??.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_refused() -> anyhow::Result<()> {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };

        let transport = TcpTransport::new(TcpOptions::default());
        let (tx, mut rx) = unbounded_channel();
        transport.events().add(move |event| {
            let _ = tx.send(describe(event));
            Ok(())
        });
        transport.connect(port, "127.0.0.1");

        assert_eq!(timeout(WAIT, rx.recv()).await?.as_deref(), Some("error"));
        assert_eq!(timeout(WAIT, rx.recv()).await?.as_deref(), Some("close:true"));
        Ok(())
    }
}
