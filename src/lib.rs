//! Draft-76 WebSocket client with connection pooling and reconnect.
//!
//! This library speaks the pre-RFC 6455 WebSocket protocol
//! (draft-hixie-76): the two-key MD5 challenge handshake and
//! sentinel-delimited text frames.
//!
//! # Architecture
//!
//! Bytes flow upward through four layers:
//!
//! - **Transport**: raw byte stream (tokio TCP by default)
//! - **Protocol engine**: handshake validation, frame decoding
//! - **Connection** ([`WebSocket`]): lifecycle and public events
//! - **Decorators**: [`Pool`] fan-out and [`Reconnect`] failure masking
//!
//! Key design principles:
//!
//! - Every socket-like type implements [`Socket`], so decorators stack
//! - Listeners are typed (`on_open`, `on_message`, ...) and return [`Result`]
//! - A listener failure becomes an "error" event instead of unwinding
//! - Each connect attempt gets a fresh transport and engine
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use draft76_client::{Pool, Reconnect, Result, Socket};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = Pool::new();
//!     let feed = Reconnect::wrap(pool.create("ws://example.com/feed")?, Duration::from_secs(1))?;
//!
//!     feed.on_message(|text| {
//!         println!("received: {text}");
//!         Ok(())
//!     });
//!     feed.on_reconnecting(|event| {
//!         println!("reconnecting in {:?}", event.delay);
//!         Ok(())
//!     });
//!
//!     feed.connect();
//!     tokio::time::sleep(Duration::from_secs(10)).await;
//!     feed.close()
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`event`] | Typed listener registries and event payloads |
//! | [`identifiers`] | Listener and timer IDs |
//! | [`pool`] | Reference-counted sharing by URL |
//! | [`protocol`] | Handshake, framing, and protocol engine |
//! | [`reconnect`] | Backoff reconnect decorator |
//! | [`transport`] | Transport and timer seams, tokio implementations |
//! | [`websocket`] | Connection lifecycle and the [`Socket`] trait |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Typed event listeners.
pub mod event;

/// Type-safe identifiers.
pub mod identifiers;

/// Connection pool.
pub mod pool;

/// Draft-76 wire protocol.
pub mod protocol;

/// Automatic reconnect.
pub mod reconnect;

/// Byte-stream transport and timers.
pub mod transport;

/// WebSocket connection.
pub mod websocket;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, HandshakeError, Result};

// Events
pub use event::{CloseEvent, Listeners, ReconnectingEvent, SocketEvents};

// Identifier types
pub use identifiers::{ListenerId, TimerId};

// Sockets
pub use pool::{Pool, PoolHandle};
pub use reconnect::{Reconnect, ReconnectOptions};
pub use websocket::{ReadyState, Socket, Target, WebSocket, WebSocketBuilder};

// Transport
pub use transport::{
    TcpOptions, TcpTransport, TcpTransportFactory, Timer, TokioTimer, Transport, TransportEvent,
    TransportFactory,
};
