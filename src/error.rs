//! Error types for the draft-76 client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! Constructors and the handshake return [`Result<T>`] which uses [`Error`].
//! Errors that happen after construction travel through "error" events:
//!
//! ```ignore
//! use draft76_client::{Socket, WebSocket};
//!
//! let ws = WebSocket::new("ws://example.com/chat")?;
//! ws.on_error(|err| {
//!     eprintln!("socket failed: {err}");
//!     Ok(())
//! });
//! ws.connect();
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Construction | [`Error::Syntax`], [`Error::Config`] |
//! | Handshake | [`Error::Handshake`] ([`HandshakeError`]) |
//! | Framing | [`Error::UnsupportedFrame`] |
//! | Transport | [`Error::Transport`], [`Error::Io`] |
//! | Application | [`Error::Callback`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// HandshakeError
// ============================================================================

/// Reasons a server handshake is rejected.
///
/// Checks run in order: status, `Upgrade`, `Connection`,
/// `Sec-WebSocket-Location`, challenge response. The first failing check wins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Status line could not be read.
    #[error("malformed status line: {line:?}")]
    Malformed {
        /// The raw status line.
        line: String,
    },

    /// Status code was not 101.
    #[error("bad status: HTTP status {status}")]
    BadStatus {
        /// Status code token as received.
        status: String,
    },

    /// `Upgrade` header missing or not `WebSocket`.
    #[error("incorrect or missing Upgrade header: {found:?}")]
    Upgrade {
        /// Value received, if any.
        found: Option<String>,
    },

    /// `Connection` header missing or not `Upgrade`.
    #[error("incorrect or missing Connection header: {found:?}")]
    Connection {
        /// Value received, if any.
        found: Option<String>,
    },

    /// `Sec-WebSocket-Location` header missing or different from the target.
    #[error("incorrect or missing Sec-WebSocket-Location header: expected {expected}, found {found:?}")]
    Location {
        /// Location derived from the connection target.
        expected: String,
        /// Value received, if any.
        found: Option<String>,
    },

    /// The 16 trailing bytes did not match the computed digest.
    #[error("bad challenge response")]
    ChallengeResponse,
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Construction Errors
    // ========================================================================
    /// URL is not a valid `ws://` or `wss://` address.
    #[error("SYNTAX_ERR: invalid WebSocket URL: {url}")]
    Syntax {
        /// The rejected URL.
        url: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Server handshake rejected.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Frame began with a marker byte other than `0x00`.
    #[error("Unsupported frame type: 0x{marker:02x}")]
    UnsupportedFrame {
        /// The leading byte of the frame.
        marker: u8,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport failure without an underlying IO error.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    // ========================================================================
    // Application Errors
    // ========================================================================
    /// Error returned by a user callback.
    #[error("Callback error: {message}")]
    Callback {
        /// Description supplied by the callback.
        message: String,
    },
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a URL syntax error.
    #[inline]
    pub fn syntax(url: impl Into<String>) -> Self {
        Self::Syntax { url: url.into() }
    }

    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an unsupported frame error.
    #[inline]
    pub fn unsupported_frame(marker: u8) -> Self {
        Self::UnsupportedFrame { marker }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a callback error.
    #[inline]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the server handshake was rejected.
    #[inline]
    #[must_use]
    pub fn is_handshake_error(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    /// Returns `true` if this is a protocol-level error (handshake or framing).
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Handshake(_) | Self::UnsupportedFrame { .. })
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io(_))
    }
}

// ============================================================================
// Tests
// ============================================================================
