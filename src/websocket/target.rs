//! Connection target derived from a `ws://` or `wss://` URL.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default port for `ws://`.
pub const WS_DEFAULT_PORT: u16 = 80;

/// Default port for `wss://`.
pub const WSS_DEFAULT_PORT: u16 = 443;

// ============================================================================
// Target
// ============================================================================

/// Where a WebSocket connects, derived once from its URL.
///
/// # Example
///
/// ```ignore
/// let target = Target::parse("ws://example.com:8080/chat?room=1")?;
/// assert_eq!(target.host(), "example.com");
/// assert_eq!(target.port(), 8080);
/// assert_eq!(target.resource(), "/chat?room=1");
/// assert_eq!(target.location(), "ws://example.com:8080/chat?room=1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    url: String,
    host: String,
    port: u16,
    default_port: u16,
    secure: bool,
    resource: String,
}

impl Target {
    /// Parses a WebSocket URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Syntax`] unless the URL parses, has a host, and uses
    /// the `ws` or `wss` scheme.
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| Error::syntax(url))?;

        let (secure, default_port) = match parsed.scheme() {
            "ws" => (false, WS_DEFAULT_PORT),
            "wss" => (true, WSS_DEFAULT_PORT),
            _ => return Err(Error::syntax(url)),
        };

        let host = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::syntax(url))?
            .to_string();

        let mut resource = match parsed.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        if let Some(query) = parsed.query() {
            resource.push('?');
            resource.push_str(query);
        }

        Ok(Self {
            url: url.to_string(),
            host,
            port: parsed.port().unwrap_or(default_port),
            default_port,
            secure,
            resource,
        })
    }

    /// The URL as given.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host name.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port to connect to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Default port of the scheme.
    #[inline]
    #[must_use]
    pub const fn default_port(&self) -> u16 {
        self.default_port
    }

    /// `true` for `wss://`.
    #[inline]
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.secure
    }

    /// Request resource: path plus query.
    #[inline]
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// `host` or `host:port`; the port is omitted when it is the scheme default.
    #[must_use]
    pub fn host_header(&self) -> String {
        if self.port == self.default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The `Sec-WebSocket-Location` value the server must echo.
    #[must_use]
    pub fn location(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.host_header(), self.resource)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

// ============================================================================
// Tests
// ============================================================================
