//! Client-side WebSocket connection.
//!
//! [`WebSocket`] owns the lifecycle of one logical connection. Every
//! socket-like type in the crate ([`WebSocket`], [`PoolHandle`],
//! [`Reconnect`]) implements [`Socket`], so they stack freely.
//!
//! # Ready States
//!
//! ```text
//! Connecting ──handshake ok──► Open ──close()──► Closing ──► Closed
//!      │                        │                              ▲
//!      └────────────────────────┴──────transport/protocol──────┘
//! ```
//!
//! A closed socket may [`connect`](Socket::connect) again.
//!
//! [`PoolHandle`]: crate::pool::PoolHandle
//! [`Reconnect`]: crate::reconnect::Reconnect

// ============================================================================
// Submodules
// ============================================================================

/// Connection lifecycle.
pub mod connection;

/// URL parsing.
pub mod target;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use crate::error::{Error, Result};
use crate::event::{CloseEvent, SocketEvents};
use crate::identifiers::ListenerId;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{WebSocket, WebSocketBuilder};
pub use target::Target;

// ============================================================================
// ReadyState
// ============================================================================

/// Lifecycle state of a socket.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadyState {
    /// Not yet open. Also the state before the first connect.
    Connecting = 0,
    /// Handshake completed.
    Open = 1,
    /// Closing handshake started locally or by the server.
    Closing = 2,
    /// Closed; may reconnect.
    Closed = 3,
}

impl ReadyState {
    /// Numeric value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ReadyState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Connecting),
            1 => Ok(Self::Open),
            2 => Ok(Self::Closing),
            3 => Ok(Self::Closed),
            other => Err(Error::config(format!("invalid ready state: {other}"))),
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Socket
// ============================================================================

/// The surface shared by connections, pool handles, and reconnect wrappers.
pub trait Socket: Send + Sync + 'static {
    /// The URL this socket was created for.
    fn url(&self) -> &str;

    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// `true` while the state is [`ReadyState::Open`].
    fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// Starts connecting. Ignored while a connection is in progress or open.
    fn connect(&self);

    /// Sends a text message. Dropped with a warning unless open.
    fn send(&self, text: &str);

    /// Closes the socket.
    ///
    /// # Errors
    ///
    /// Propagates a failing error listener reached while emitting the close.
    fn close(&self) -> Result<()>;

    /// The event surface.
    fn events(&self) -> &SocketEvents;

    /// Subscribes to "open".
    fn on_open<F>(&self, listener: F) -> ListenerId
    where
        Self: Sized,
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.events().on_open(listener)
    }

    /// Subscribes to "message".
    fn on_message<F>(&self, listener: F) -> ListenerId
    where
        Self: Sized,
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        self.events().on_message(listener)
    }

    /// Subscribes to "close".
    fn on_close<F>(&self, listener: F) -> ListenerId
    where
        Self: Sized,
        F: Fn(&CloseEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.events().on_close(listener)
    }

    /// Subscribes to "error".
    fn on_error<F>(&self, listener: F) -> ListenerId
    where
        Self: Sized,
        F: Fn(&Error) -> Result<()> + Send + Sync + 'static,
    {
        self.events().on_error(listener)
    }

    /// Removes a listener registered through any `on_*` method.
    fn remove_listener(&self, id: ListenerId) -> bool {
        self.events().remove_listener(id)
    }
}

// ============================================================================
// Tests
// ============================================================================
