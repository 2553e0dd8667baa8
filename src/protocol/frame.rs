//! Sentinel-delimited message frames.
//!
//! | Frame | Bytes |
//! |-------|-------|
//! | Text | `0x00 <UTF-8 payload> 0xFF` |
//! | Closing | `0xFF 0x00` |

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Marks the start of a text frame.
pub const TEXT_MARKER: u8 = 0x00;

/// Ends a text frame; starts a closing frame.
pub const SENTINEL: u8 = 0xff;

/// The closing handshake frame, sent in both directions.
pub const CLOSING_FRAME: [u8; 2] = [SENTINEL, 0x00];

// ============================================================================
// Frame
// ============================================================================

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text message.
    Text(String),
    /// The peer started the closing handshake.
    Close,
}

// ============================================================================
// Codec
// ============================================================================

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when the frame is not yet
/// complete. Payloads are decoded as lossy UTF-8.
///
/// # Errors
///
/// [`Error::UnsupportedFrame`] if the frame starts with anything other than
/// `0x00` or the closing sequence.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
    match buf.first() {
        None => return Ok(None),
        Some(&SENTINEL) => {
            return match buf.get(1) {
                None => Ok(None),
                Some(0x00) => {
                    buf.advance(CLOSING_FRAME.len());
                    Ok(Some(Frame::Close))
                }
                Some(_) => Err(Error::unsupported_frame(SENTINEL)),
            };
        }
        Some(&TEXT_MARKER) => {}
        Some(&marker) => return Err(Error::unsupported_frame(marker)),
    }

    let Some(end) = buf[1..].iter().position(|b| *b == SENTINEL).map(|pos| pos + 1) else {
        return Ok(None);
    };

    let frame = buf.split_to(end + 1);
    let text = String::from_utf8_lossy(&frame[1..end]).into_owned();
    Ok(Some(Frame::Text(text)))
}

/// Encodes `text` as a text frame.
#[must_use]
pub fn encode_text(text: &str) -> Bytes {
    let mut frame = BytesMut::with_capacity(text.len() + 2);
    frame.put_u8(TEXT_MARKER);
    frame.put_slice(text.as_bytes());
    frame.put_u8(SENTINEL);
    frame.freeze()
}

// ============================================================================
// Tests
// ============================================================================
