//! Protocol engine: handshake and framing over one transport.
//!
//! The engine owns the receive buffer and the protocol phase. It consumes
//! transport bytes, and reports what happened as [`EngineEvent`]s.
//!
//! # Phases
//!
//! ```text
//! Handshaking ──valid response──► Open ──0xFF 0x00──► Closed
//!      │                            │
//!      └──────protocol error────────┴──────────────► Failed
//! ```
//!
//! Data received in `Closed` or `Failed` is ignored.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::Listeners;
use crate::identifiers::ListenerId;
use crate::transport::{Transport, TransportEvent};
use crate::websocket::Target;

use super::frame::{self, CLOSING_FRAME, Frame};
use super::handshake::{ClientHandshake, RESPONSE_LEN, ResponseHead, header_block_len};

// ============================================================================
// EngineEvent
// ============================================================================

/// What the engine reports to its owner, in wire order.
#[derive(Debug)]
pub enum EngineEvent {
    /// The handshake response was valid.
    Open,
    /// A complete text frame arrived.
    Message(String),
    /// The server sent a closing frame.
    Closing,
    /// The closing handshake completed.
    Close,
    /// The handshake or framing failed. No further events follow.
    Error(Error),
}

// ============================================================================
// EngineState
// ============================================================================

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for the complete handshake response.
    Handshaking,
    /// Exchanging frames.
    Open,
    /// The closing handshake completed.
    Closed,
    /// A protocol error occurred.
    Failed,
}

// ============================================================================
// ProtocolEngine
// ============================================================================

/// Drives the handshake and framing for one connect attempt.
pub struct ProtocolEngine {
    inner: Mutex<EngineInner>,
    listeners: Listeners<EngineEvent>,
}

struct EngineInner {
    state: EngineState,
    pending: BytesMut,
    handshake: Option<ClientHandshake>,
    response: Option<ResponseHead>,
    send_enabled: bool,
    close_sent: bool,
    transport: Option<Arc<dyn Transport>>,
    data_listener: Option<ListenerId>,
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine {
    /// Creates an engine with no transport attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EngineInner {
                state: EngineState::Handshaking,
                pending: BytesMut::new(),
                handshake: None,
                response: None,
                send_enabled: true,
                close_sent: false,
                transport: None,
                data_listener: None,
            }),
            listeners: Listeners::new(),
        }
    }

    /// Engine event listeners.
    #[inline]
    pub fn events(&self) -> &Listeners<EngineEvent> {
        &self.listeners
    }

    /// Binds the engine to `transport` and starts consuming its data.
    pub fn attach(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let engine = Arc::downgrade(self);
        let id = transport.events().add(move |event| match (event, engine.upgrade()) {
            (TransportEvent::Data(chunk), Some(engine)) => engine.receive(chunk),
            _ => Ok(()),
        });

        let mut inner = self.inner.lock();
        inner.transport = Some(transport);
        inner.data_listener = Some(id);
    }

    /// Stops consuming transport data and drops every engine listener.
    pub fn detach(&self) {
        let subscription = {
            let mut inner = self.inner.lock();
            inner.data_listener.take().zip(inner.transport.clone())
        };
        if let Some((id, transport)) = subscription {
            transport.events().remove(id);
        }
        self.listeners.clear();
    }

    /// Sends the opening handshake for `target` with fresh keys.
    pub fn open(&self, target: &Target) {
        self.open_with(ClientHandshake::generate(target, &mut rand::rng()));
    }

    /// Sends the given opening handshake.
    pub fn open_with(&self, handshake: ClientHandshake) {
        let mut inner = self.inner.lock();
        let Some(transport) = inner.transport.clone() else {
            warn!("Handshake requested without a transport");
            return;
        };

        debug!(location = handshake.location(), "Sending opening handshake");
        transport.write(Bytes::from(handshake.to_bytes()));

        inner.state = EngineState::Handshaking;
        inner.pending.clear();
        inner.handshake = Some(handshake);
    }

    /// Consumes bytes from the transport.
    ///
    /// # Errors
    ///
    /// Propagates a failing error listener of the owner. Protocol errors are
    /// reported as [`EngineEvent::Error`], not returned.
    pub fn receive(&self, chunk: &[u8]) -> Result<()> {
        let events = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, EngineState::Closed | EngineState::Failed) {
                trace!(len = chunk.len(), state = ?inner.state, "Ignoring data");
                return Ok(());
            }

            inner.pending.extend_from_slice(chunk);

            let mut events = Vec::new();
            if let Err(err) = inner.advance(&mut events) {
                debug!(error = %err, "Protocol error");
                inner.state = EngineState::Failed;
                inner.pending.clear();
                events.push(EngineEvent::Error(err));
            }
            events
        };

        for event in &events {
            self.listeners.emit(event)?;
        }
        Ok(())
    }

    /// Sends a text frame. Dropped unless the engine is open and no close has
    /// been started.
    pub fn send(&self, text: &str) {
        let inner = self.inner.lock();
        if !inner.send_enabled {
            debug!("Dropping send after close started");
            return;
        }
        if inner.state != EngineState::Open {
            warn!(state = ?inner.state, "Dropping send before handshake completed");
            return;
        }
        if let Some(transport) = &inner.transport {
            transport.write(frame::encode_text(text));
        }
    }

    /// Starts the closing handshake from this side.
    ///
    /// Further sends are dropped. Incoming frames are still delivered until
    /// the server answers with its own closing frame.
    pub fn client_close(&self) {
        self.inner.lock().send_closing_frame();
    }

    /// `true` once the handshake completed and until the connection closes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().state == EngineState::Open
    }

    /// Current phase.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Headers of the accepted handshake response.
    #[must_use]
    pub fn response(&self) -> Option<ResponseHead> {
        self.inner.lock().response.clone()
    }
}

impl EngineInner {
    /// Processes buffered bytes as far as possible.
    fn advance(&mut self, events: &mut Vec<EngineEvent>) -> Result<()> {
        if self.state == EngineState::Handshaking {
            let Some(head_len) = header_block_len(&self.pending) else {
                return Ok(());
            };
            if self.pending.len() < head_len + RESPONSE_LEN {
                return Ok(());
            }
            let Some(handshake) = self.handshake.as_ref() else {
                return Ok(());
            };

            let head = self.pending.split_to(head_len);
            let digest = self.pending.split_to(RESPONSE_LEN);

            let response = ResponseHead::parse(&head)?;
            response.verify(handshake.location())?;
            handshake.verify_response(&digest)?;

            debug!("Handshake accepted");
            self.response = Some(response);
            self.state = EngineState::Open;
            events.push(EngineEvent::Open);
        }

        while self.state == EngineState::Open {
            match frame::decode(&mut self.pending)? {
                Some(Frame::Text(text)) => {
                    trace!(len = text.len(), "Text frame");
                    events.push(EngineEvent::Message(text));
                }
                Some(Frame::Close) => self.server_close(events),
                None => break,
            }
        }

        Ok(())
    }

    /// Answers the server's closing frame and finishes the connection.
    fn server_close(&mut self, events: &mut Vec<EngineEvent>) {
        debug!("Server started closing handshake");
        events.push(EngineEvent::Closing);

        self.send_closing_frame();
        if let Some(transport) = &self.transport {
            transport.end();
        }

        self.state = EngineState::Closed;
        self.pending.clear();
        events.push(EngineEvent::Close);
    }

    /// Disables sends and writes the closing frame, at most once.
    fn send_closing_frame(&mut self) {
        self.send_enabled = false;
        if self.close_sent {
            return;
        }
        if let Some(transport) = &self.transport
            && transport.is_writable()
        {
            trace!("Writing closing frame");
            transport.write(Bytes::from_static(&CLOSING_FRAME));
            self.close_sent = true;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
