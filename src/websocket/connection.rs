//! WebSocket connection lifecycle.
//!
//! Each call to [`connect`](Socket::connect) creates a fresh transport and
//! protocol engine (an "attempt"). Events from an attempt that is no longer
//! current are ignored, so a reconnect never sees stale callbacks.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{CloseEvent, SocketEvents};
use crate::identifiers::ListenerId;
use crate::protocol::{EngineEvent, ProtocolEngine};
use crate::transport::{TcpOptions, TcpTransportFactory, Transport, TransportEvent, TransportFactory};

use super::{ReadyState, Socket, Target};

// ============================================================================
// WebSocket
// ============================================================================

/// A draft-76 WebSocket client connection.
///
/// Cloning yields another handle to the same connection.
///
/// # Example
///
/// ```ignore
/// use draft76_client::{Socket, WebSocket};
///
/// let ws = WebSocket::new("ws://example.com/chat")?;
/// ws.on_open(|| Ok(()));
/// ws.on_message(|text| {
///     println!("received {text}");
///     Ok(())
/// });
/// ws.connect();
/// ```
#[derive(Clone)]
pub struct WebSocket {
    inner: Arc<Inner>,
}

struct Inner {
    target: Target,
    transports: Arc<dyn TransportFactory>,
    events: SocketEvents,
    state: Mutex<ConnectionState>,
}

struct ConnectionState {
    ready_state: ReadyState,
    should_connect: bool,
    attempt: Option<Attempt>,
    attempts: u64,
}

/// Transport and engine of one connect attempt.
struct Attempt {
    id: u64,
    transport: Arc<dyn Transport>,
    engine: Arc<ProtocolEngine>,
    transport_listener: ListenerId,
}

impl Attempt {
    /// Unsubscribes from the transport and engine.
    fn detach(&self) {
        self.transport.events().remove(self.transport_listener);
        self.engine.detach();
    }
}

/// What `close` decided under the lock.
enum CloseAction {
    Nothing,
    NeverStarted,
    AbortHandshake(Attempt),
    StartClosing(Arc<ProtocolEngine>),
}

impl fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("url", &self.inner.target.url())
            .field("ready_state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

impl WebSocket {
    /// Creates an unconnected socket using TCP transports.
    ///
    /// # Errors
    ///
    /// [`Error::Syntax`] if `url` is not a valid `ws://` or `wss://` URL.
    pub fn new(url: &str) -> Result<Self> {
        Self::builder(url).build()
    }

    /// Creates an unconnected socket using the given transports.
    ///
    /// # Errors
    ///
    /// [`Error::Syntax`] if `url` is not a valid `ws://` or `wss://` URL.
    pub fn with_transport(url: &str, transports: Arc<dyn TransportFactory>) -> Result<Self> {
        Self::builder(url).transport(transports).build()
    }

    /// Starts building a socket.
    #[must_use]
    pub fn builder(url: &str) -> WebSocketBuilder {
        WebSocketBuilder::new(url)
    }

    /// Where this socket connects.
    #[inline]
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    fn from_parts(target: Target, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                transports,
                events: SocketEvents::new(),
                state: Mutex::new(ConnectionState {
                    ready_state: ReadyState::Connecting,
                    should_connect: true,
                    attempt: None,
                    attempts: 0,
                }),
            }),
        }
    }
}

impl Socket for WebSocket {
    fn url(&self) -> &str {
        self.inner.target.url()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().ready_state
    }

    fn connect(&self) {
        let (transport, id) = {
            let mut state = self.inner.state.lock();
            if !state.should_connect {
                debug!(url = %self.inner.target, state = %state.ready_state, "Connect ignored");
                return;
            }

            state.should_connect = false;
            state.ready_state = ReadyState::Connecting;
            state.attempts += 1;
            let id = state.attempts;

            let transport = self.inner.transports.create();
            let engine = Arc::new(ProtocolEngine::new());
            engine.attach(Arc::clone(&transport));

            let weak = Arc::downgrade(&self.inner);
            let transport_listener = transport.events().add(move |event| {
                weak.upgrade()
                    .map_or(Ok(()), |inner| inner.on_transport_event(id, event))
            });

            let weak = Arc::downgrade(&self.inner);
            engine.events().add(move |event| {
                weak.upgrade()
                    .map_or(Ok(()), |inner| inner.on_engine_event(id, event))
            });

            state.attempt = Some(Attempt {
                id,
                transport: Arc::clone(&transport),
                engine,
                transport_listener,
            });
            (transport, id)
        };

        let target = &self.inner.target;
        debug!(url = %target, attempt = id, "Connecting");
        transport.connect(target.port(), target.host());
    }

    fn send(&self, text: &str) {
        let engine = self
            .inner
            .state
            .lock()
            .attempt
            .as_ref()
            .map(|attempt| Arc::clone(&attempt.engine));

        match engine {
            Some(engine) => engine.send(text),
            None => warn!(url = %self.inner.target, "Dropping send: not connected"),
        }
    }

    fn close(&self) -> Result<()> {
        let action = {
            let mut state = self.inner.state.lock();
            if state.ready_state == ReadyState::Closed {
                CloseAction::Nothing
            } else {
                match state.attempt.take() {
                    None => {
                        state.ready_state = ReadyState::Closed;
                        state.should_connect = true;
                        CloseAction::NeverStarted
                    }
                    Some(attempt) if !attempt.engine.is_open() => {
                        state.ready_state = ReadyState::Closed;
                        state.should_connect = true;
                        CloseAction::AbortHandshake(attempt)
                    }
                    Some(attempt) => {
                        state.ready_state = ReadyState::Closing;
                        let engine = Arc::clone(&attempt.engine);
                        state.attempt = Some(attempt);
                        CloseAction::StartClosing(engine)
                    }
                }
            }
        };

        let url = &self.inner.target;
        match action {
            CloseAction::Nothing => {
                debug!(%url, "Close ignored: already closed");
                Ok(())
            }
            CloseAction::NeverStarted => {
                debug!(%url, "Closed before connecting");
                self.inner
                    .events
                    .emit_close(&CloseEvent::unclean("closed before connecting"))
            }
            CloseAction::AbortHandshake(attempt) => {
                debug!(%url, attempt = attempt.id, "Closed during handshake");
                attempt.detach();
                attempt.transport.end();
                self.inner
                    .events
                    .emit_close(&CloseEvent::unclean("closed before handshake completed"))
            }
            CloseAction::StartClosing(engine) => {
                debug!(%url, "Starting closing handshake");
                engine.client_close();
                Ok(())
            }
        }
    }

    fn events(&self) -> &SocketEvents {
        &self.inner.events
    }
}

impl Inner {
    fn is_current(&self, id: u64) -> bool {
        self.state
            .lock()
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.id == id)
    }

    fn current_engine(&self, id: u64) -> Option<Arc<ProtocolEngine>> {
        self.state
            .lock()
            .attempt
            .as_ref()
            .filter(|attempt| attempt.id == id)
            .map(|attempt| Arc::clone(&attempt.engine))
    }

    fn on_transport_event(&self, id: u64, event: &TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Connected => {
                if let Some(engine) = self.current_engine(id) {
                    engine.open(&self.target);
                }
                Ok(())
            }
            TransportEvent::Data(_) => Ok(()),
            TransportEvent::Error(err) => self.fail(id, err),
            TransportEvent::Close { had_error } => {
                let event = if *had_error {
                    CloseEvent::unclean("transport closed with error")
                } else {
                    CloseEvent::clean()
                };
                self.finish(id, &event)
            }
        }
    }

    fn on_engine_event(&self, id: u64, event: &EngineEvent) -> Result<()> {
        if !self.is_current(id) {
            return Ok(());
        }

        match event {
            EngineEvent::Open => {
                self.state.lock().ready_state = ReadyState::Open;
                debug!(url = %self.target, "Open");
                self.events.emit_open()
            }
            EngineEvent::Message(text) => self.events.emit_message(text),
            EngineEvent::Closing => {
                self.state.lock().ready_state = ReadyState::Closing;
                Ok(())
            }
            EngineEvent::Close => self.finish(id, &CloseEvent::clean()),
            EngineEvent::Error(err) => self.fail(id, err),
        }
    }

    /// Reports `err` and closes the attempt uncleanly.
    fn fail(&self, id: u64, err: &Error) -> Result<()> {
        if !self.is_current(id) {
            return Ok(());
        }
        warn!(url = %self.target, error = %err, "Connection failed");
        let reported = self.events.emit_error(err);
        let closed = self.finish(id, &CloseEvent::unclean(err.to_string()));
        reported.and(closed)
    }

    /// Ends attempt `id` and emits "close" once.
    fn finish(&self, id: u64, event: &CloseEvent) -> Result<()> {
        let attempt = {
            let mut state = self.state.lock();
            if !state.attempt.as_ref().is_some_and(|attempt| attempt.id == id) {
                return Ok(());
            }
            state.ready_state = ReadyState::Closed;
            state.should_connect = true;
            state.attempt.take()
        };

        if let Some(attempt) = attempt {
            attempt.detach();
            // Protocol failures leave the stream up; the peer still needs a FIN.
            if attempt.transport.is_writable() {
                attempt.transport.end();
            }
        }

        debug!(url = %self.target, was_clean = event.was_clean, "Closed");
        self.events.emit_close(event)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(attempt) = self.state.get_mut().attempt.take() {
            debug!(url = %self.target, attempt = attempt.id, "Last handle dropped, ending transport");
            attempt.detach();
            attempt.transport.end();
        }
    }
}

// ============================================================================
// WebSocketBuilder
// ============================================================================

/// Builder for [`WebSocket`].
///
/// # Example
///
/// ```ignore
/// let ws = WebSocket::builder("ws://example.com/chat")
///     .nodelay(false)
///     .build()?;
/// ```
pub struct WebSocketBuilder {
    url: String,
    transports: Option<Arc<dyn TransportFactory>>,
    tcp: TcpOptions,
}

impl fmt::Debug for WebSocketBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketBuilder")
            .field("url", &self.url)
            .field("custom_transport", &self.transports.is_some())
            .field("tcp", &self.tcp)
            .finish()
    }
}

impl WebSocketBuilder {
    /// Creates a builder for `url`.
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            transports: None,
            tcp: TcpOptions::default(),
        }
    }

    /// Uses a custom transport factory instead of TCP.
    #[must_use]
    pub fn transport(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Sets TCP options. Ignored with a custom transport.
    #[must_use]
    pub fn tcp_options(mut self, options: TcpOptions) -> Self {
        self.tcp = options;
        self
    }

    /// Sets `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.tcp = self.tcp.with_nodelay(nodelay);
        self
    }

    /// Builds the socket. It does not connect.
    ///
    /// # Errors
    ///
    /// [`Error::Syntax`] if the URL is not a valid `ws://` or `wss://` URL.
    pub fn build(self) -> Result<WebSocket> {
        let target = Target::parse(&self.url)?;
        if target.is_secure() && self.transports.is_none() {
            debug!(url = %target, "wss:// over plain TCP transport");
        }
        let transports = self
            .transports
            .unwrap_or_else(|| Arc::new(TcpTransportFactory::new(self.tcp)));
        Ok(WebSocket::from_parts(target, transports))
    }
}

// ============================================================================
// Tests
// ============================================================================
