//! Draft-76 wire protocol.
//!
//! # Protocol Overview
//!
//! | Step | Direction | Bytes |
//! |------|-----------|-------|
//! | Request | Client → Server | HTTP `GET` with two security keys, then 8 challenge bytes |
//! | Response | Server → Client | `101` status, headers, then a 16-byte MD5 digest |
//! | Text frame | Both | `0x00 <UTF-8> 0xFF` |
//! | Closing frame | Both | `0xFF 0x00` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `engine` | Per-attempt state machine over a transport |
//! | `frame` | Frame codec |
//! | `handshake` | Keys, challenge, and response validation |

// ============================================================================
// Submodules
// ============================================================================

/// Protocol engine.
pub mod engine;

/// Frame codec.
pub mod frame;

/// Opening handshake.
pub mod handshake;

// ============================================================================
// Re-exports
// ============================================================================

pub use engine::{EngineEvent, EngineState, ProtocolEngine};
pub use frame::Frame;
pub use handshake::{ClientHandshake, ResponseHead, SecurityKey};
