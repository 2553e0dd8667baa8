//! Opening handshake: security keys, challenge, and response validation.
//!
//! # Client Request
//!
//! ```text
//! GET /resource HTTP/1.1
//! Upgrade: WebSocket
//! Connection: Upgrade
//! Host: example.com[:port]
//! Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5
//! Sec-WebSocket-Key2: 12998 5 Y3 1  .P00
//!
//! <8 challenge bytes>
//! ```
//!
//! # Server Response
//!
//! Status `101`, the `Upgrade`, `Connection` and `Sec-WebSocket-Location`
//! headers, a blank line, then 16 bytes: MD5 over both key numbers
//! (big-endian) followed by the challenge.

// ============================================================================
// Imports
// ============================================================================

use base64::Engine;
use base64::engine::general_purpose::STANDARD as Base64Standard;
use md5::{Digest, Md5};
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::HandshakeError;
use crate::websocket::Target;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of spaces inserted into a key.
const MAX_SPACES: u32 = 12;

/// Maximum number of noise characters inserted into a key.
const MAX_NOISE: u32 = 12;

/// Length of the challenge sent after the request headers.
pub const CHALLENGE_LEN: usize = 8;

/// Length of the digest the server sends after its headers.
pub const RESPONSE_LEN: usize = 16;

/// End of an HTTP header block.
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

// ============================================================================
// SecurityKey
// ============================================================================

/// A `Sec-WebSocket-Key` value and the number it encodes.
///
/// The text is `number * spaces` in decimal with random noise characters and
/// `spaces` space characters mixed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityKey {
    text: String,
    number: u32,
}

impl SecurityKey {
    /// Creates a key from its parts.
    #[inline]
    #[must_use]
    pub fn from_parts(text: impl Into<String>, number: u32) -> Self {
        Self {
            text: text.into(),
            number,
        }
    }

    /// Generates a fresh key.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let spaces = rng.random_range(1..=MAX_SPACES);
        let noise = rng.random_range(1..=MAX_NOISE);
        let number = rng.random_range(0..=u32::MAX / spaces);

        let mut text = (u64::from(number) * u64::from(spaces)).to_string();

        for _ in 0..noise {
            let pos = rng.random_range(0..=text.len());
            text.insert(pos, noise_char(rng));
        }

        // Never first, never last: text is at least one digit plus one noise char.
        for _ in 0..spaces {
            let pos = rng.random_range(1..text.len());
            text.insert(pos, ' ');
        }

        Self { text, number }
    }

    /// Recovers the key number from its text, as a server would.
    ///
    /// Returns `None` if the text has no spaces, no digits, or the digits are
    /// not a multiple of the space count.
    #[must_use]
    pub fn decode(text: &str) -> Option<u32> {
        let digits: String = text.chars().filter(char::is_ascii_digit).collect();
        let spaces = text.chars().filter(|c| *c == ' ').count() as u64;
        if spaces == 0 || digits.is_empty() {
            return None;
        }

        let value: u64 = digits.parse().ok()?;
        if value % spaces != 0 {
            return None;
        }
        u32::try_from(value / spaces).ok()
    }

    /// The header text.
    #[inline]
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The encoded number.
    #[inline]
    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }

    /// The number as 4 big-endian bytes, as fed to the digest.
    #[inline]
    #[must_use]
    pub const fn to_bytes(&self) -> [u8; 4] {
        self.number.to_be_bytes()
    }
}

/// A printable character that is not a digit.
fn noise_char<R: Rng + ?Sized>(rng: &mut R) -> char {
    let c: u8 = rng.random_range(0x21..=0x7e);
    if c.is_ascii_digit() {
        char::from(c + 10)
    } else {
        char::from(c)
    }
}

// ============================================================================
// Challenge
// ============================================================================

/// Generates the 8 random challenge bytes.
pub fn generate_challenge<R: Rng + ?Sized>(rng: &mut R) -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rng.fill(&mut challenge[..]);
    challenge
}

/// Computes the expected server response: base64 of
/// MD5(key1 ‖ key2 ‖ challenge).
#[must_use]
pub fn challenge_response(
    key1: &SecurityKey,
    key2: &SecurityKey,
    challenge: &[u8; CHALLENGE_LEN],
) -> String {
    digest_base64(key1.number(), key2.number(), challenge)
}

/// Base64 of MD5 over two big-endian key numbers and a challenge.
pub(crate) fn digest_base64(number1: u32, number2: u32, challenge: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(number1.to_be_bytes());
    hasher.update(number2.to_be_bytes());
    hasher.update(challenge);
    Base64Standard.encode(hasher.finalize())
}

// ============================================================================
// ClientHandshake
// ============================================================================

/// Everything one handshake attempt sends and expects back.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key1: SecurityKey,
    key2: SecurityKey,
    challenge: [u8; CHALLENGE_LEN],
    resource: String,
    host: String,
    location: String,
}

impl ClientHandshake {
    /// Creates a handshake from explicit keys and challenge.
    #[must_use]
    pub fn new(
        target: &Target,
        key1: SecurityKey,
        key2: SecurityKey,
        challenge: [u8; CHALLENGE_LEN],
    ) -> Self {
        Self {
            key1,
            key2,
            challenge,
            resource: target.resource().to_string(),
            host: target.host_header(),
            location: target.location(),
        }
    }

    /// Creates a handshake with fresh random keys and challenge.
    pub fn generate<R: Rng + ?Sized>(target: &Target, rng: &mut R) -> Self {
        let key1 = SecurityKey::generate(rng);
        let key2 = SecurityKey::generate(rng);
        let challenge = generate_challenge(rng);
        Self::new(target, key1, key2, challenge)
    }

    /// First key.
    #[inline]
    #[must_use]
    pub fn key1(&self) -> &SecurityKey {
        &self.key1
    }

    /// Second key.
    #[inline]
    #[must_use]
    pub fn key2(&self) -> &SecurityKey {
        &self.key2
    }

    /// Challenge bytes.
    #[inline]
    #[must_use]
    pub fn challenge(&self) -> &[u8; CHALLENGE_LEN] {
        &self.challenge
    }

    /// The location the server must echo.
    #[inline]
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Base64 digest the server must send back.
    #[must_use]
    pub fn expected_response(&self) -> String {
        challenge_response(&self.key1, &self.key2, &self.challenge)
    }

    /// The request bytes: headers, blank line, then the raw challenge.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = format!(
            "GET {} HTTP/1.1\r\n\
             Upgrade: WebSocket\r\n\
             Connection: Upgrade\r\n\
             Host: {}\r\n\
             Sec-WebSocket-Key1: {}\r\n\
             Sec-WebSocket-Key2: {}\r\n\
             \r\n",
            self.resource,
            self.host,
            self.key1.text(),
            self.key2.text(),
        );

        let mut request = head.into_bytes();
        request.extend_from_slice(&self.challenge);
        request
    }

    /// Checks the 16 digest bytes sent after the response headers.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::ChallengeResponse`] if they differ from
    /// [`expected_response`](Self::expected_response).
    pub fn verify_response(&self, received: &[u8]) -> Result<(), HandshakeError> {
        if Base64Standard.encode(received) == self.expected_response() {
            Ok(())
        } else {
            Err(HandshakeError::ChallengeResponse)
        }
    }
}

// ============================================================================
// ResponseHead
// ============================================================================

/// Returns the length of the header block including its `\r\n\r\n`, if the
/// terminator is present.
#[must_use]
pub fn header_block_len(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Parsed status line and headers of the server response.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    status: String,
    /// Header names are stored lowercased.
    headers: FxHashMap<String, String>,
}

impl ResponseHead {
    /// Parses a header block (status line through the blank line).
    ///
    /// Header lines without `": "` are skipped.
    ///
    /// # Errors
    ///
    /// [`HandshakeError::Malformed`] if the status line has no status token.
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let status = status_line
            .split(' ')
            .nth(1)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| HandshakeError::Malformed {
                line: status_line.to_string(),
            })?
            .to_string();

        let mut headers = FxHashMap::default();
        for line in lines.take_while(|line| !line.is_empty()) {
            match line.split_once(": ") {
                Some((name, value)) => {
                    headers.insert(name.to_ascii_lowercase(), value.to_string());
                }
                None => trace!(line, "Skipping malformed header line"),
            }
        }

        Ok(Self { status, headers })
    }

    /// Status code token.
    #[inline]
    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Looks up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Validates status, `Upgrade`, `Connection` and `Sec-WebSocket-Location`,
    /// in that order.
    ///
    /// # Errors
    ///
    /// The [`HandshakeError`] of the first failing check.
    pub fn verify(&self, location: &str) -> Result<(), HandshakeError> {
        if self.status != "101" {
            return Err(HandshakeError::BadStatus {
                status: self.status.clone(),
            });
        }

        let upgrade = self.header("Upgrade");
        if upgrade != Some("WebSocket") {
            return Err(HandshakeError::Upgrade {
                found: upgrade.map(str::to_string),
            });
        }

        let connection = self.header("Connection");
        if connection != Some("Upgrade") {
            return Err(HandshakeError::Connection {
                found: connection.map(str::to_string),
            });
        }

        let found = self.header("Sec-WebSocket-Location");
        if found != Some(location) {
            return Err(HandshakeError::Location {
                expected: location.to_string(),
                found: found.map(str::to_string),
            });
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
