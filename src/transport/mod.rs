//! Byte-stream transport and timer seams.
//!
//! The protocol engine never touches sockets directly. It writes through a
//! [`Transport`] and learns about the stream through [`TransportEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect/write/end   ┌──────────────┐
//! │  WebSocket   │ ───────────────────► │  Transport   │ ◄──► TCP
//! │  + Engine    │ ◄─────────────────── │  (tokio task)│
//! └──────────────┘  Connected/Data/     └──────────────┘
//!                   Error/Close
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `tcp` | tokio `TcpStream` transport |
//! | `timer` | Timer seam and tokio-backed timer |

// ============================================================================
// Submodules
// ============================================================================

/// tokio TCP transport.
pub mod tcp;

/// Timers for reconnect scheduling.
pub mod timer;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::event::Listeners;

// ============================================================================
// Re-exports
// ============================================================================

pub use tcp::{TcpOptions, TcpTransport, TcpTransportFactory};
pub use timer::{Timer, TokioTimer};

// ============================================================================
// TransportEvent
// ============================================================================

/// Notifications from a transport, delivered in stream order.
#[derive(Debug)]
pub enum TransportEvent {
    /// The stream is connected and writable.
    Connected,
    /// Bytes arrived.
    Data(Bytes),
    /// The stream failed. A `Close { had_error: true }` follows.
    Error(Error),
    /// The stream is gone.
    Close {
        /// `true` if the close was caused by an error.
        had_error: bool,
    },
}

// ============================================================================
// Transport
// ============================================================================

/// A raw byte stream.
///
/// Implementations must not deliver events synchronously from inside
/// `write` or `end`; `connect` may report an immediate failure synchronously.
pub trait Transport: Send + Sync {
    /// Starts connecting to `host:port`.
    fn connect(&self, port: u16, host: &str);

    /// Queues bytes for writing.
    fn write(&self, bytes: Bytes);

    /// Half-closes: no more writes will follow.
    fn end(&self);

    /// `true` while writes are accepted.
    fn is_writable(&self) -> bool;

    /// Event listeners of this transport.
    fn events(&self) -> &Listeners<TransportEvent>;
}

/// Creates one transport per connect attempt.
pub trait TransportFactory: Send + Sync {
    /// Creates a fresh, unconnected transport.
    fn create(&self) -> Arc<dyn Transport>;
}
