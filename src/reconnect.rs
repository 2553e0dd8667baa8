//! Automatic reconnect with exponential backoff.
//!
//! [`Reconnect`] wraps any [`Socket`] and hides unexpected closes: instead
//! of "close" it emits "reconnecting" and calls `connect` again after a
//! delay that doubles on every consecutive failure and resets on open.
//!
//! # Event Mapping
//!
//! | Wrapped event | Public event |
//! |---------------|--------------|
//! | open | open (backoff reset) |
//! | message | message |
//! | error | none |
//! | close, unexpected | reconnecting |
//! | close, unexpected, timer unavailable | error, then close |
//! | close, after [`Socket::close`] | close, unmodified |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{CloseEvent, Listeners, ReconnectingEvent, SocketEvents};
use crate::identifiers::{ListenerId, TimerId};
use crate::transport::{Timer, TokioTimer};
use crate::websocket::{ReadyState, Socket, WebSocket};

// ============================================================================
// Constants
// ============================================================================

/// Delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// ReconnectOptions
// ============================================================================

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectOptions {
    /// Delay before the first attempt after an unexpected close.
    pub default_timeout: Duration,

    /// Upper bound for the doubled delay. Unbounded when `None`.
    pub max_timeout: Option<Duration>,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_TIMEOUT)
    }
}

impl ReconnectOptions {
    /// Creates unbounded options starting at `default_timeout`.
    #[inline]
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            max_timeout: None,
        }
    }

    /// Caps the delay.
    #[inline]
    #[must_use]
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = Some(max_timeout);
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the default timeout is zero or the cap is below it.
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(Error::config("Reconnect timeout must be > 0"));
        }
        if let Some(max) = self.max_timeout
            && max < self.default_timeout
        {
            return Err(Error::config(
                "Max reconnect timeout must be >= default reconnect timeout",
            ));
        }
        Ok(())
    }

    /// The delay following `current`.
    #[must_use]
    pub fn next_timeout(&self, current: Duration) -> Duration {
        let doubled = current.saturating_mul(2);
        match self.max_timeout {
            Some(max) => doubled.min(max),
            None => doubled,
        }
    }
}

// ============================================================================
// Reconnect
// ============================================================================

/// A socket that reconnects itself after unexpected closes.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use draft76_client::{Reconnect, Socket, WebSocket};
///
/// let ws = Reconnect::wrap(WebSocket::new("ws://example.com/feed")?, Duration::from_millis(500))?;
/// ws.on_reconnecting(|event| {
///     println!("retrying in {:?}", event.delay);
///     Ok(())
/// });
/// ws.connect();
/// ```
pub struct Reconnect<S: Socket = WebSocket> {
    inner: Arc<ReconnectInner<S>>,
}

struct ReconnectInner<S> {
    socket: S,
    options: ReconnectOptions,
    timer: Arc<dyn Timer>,
    events: SocketEvents,
    reconnecting: Listeners<ReconnectingEvent>,
    state: Mutex<BackoffState>,
}

struct BackoffState {
    current_timeout: Duration,
    pending_timer: Option<TimerId>,
    /// Bumped on every schedule and on close; stale timers compare unequal.
    generation: u64,
    closed_by_user: bool,
    close_delivered: bool,
}

impl<S: Socket> Clone for Reconnect<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Socket> fmt::Debug for Reconnect<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Reconnect")
            .field("url", &self.inner.socket.url())
            .field("current_timeout", &state.current_timeout)
            .field("pending_timer", &state.pending_timer)
            .field("closed_by_user", &state.closed_by_user)
            .finish_non_exhaustive()
    }
}

impl<S: Socket> Reconnect<S> {
    /// Wraps `socket` with a tokio timer.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `default_timeout` is zero.
    pub fn wrap(socket: S, default_timeout: Duration) -> Result<Self> {
        Self::with_options(
            socket,
            ReconnectOptions::new(default_timeout),
            Arc::new(TokioTimer::new()),
        )
    }

    /// Wraps `socket` with explicit options and timer.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the options are invalid.
    pub fn with_options(socket: S, options: ReconnectOptions, timer: Arc<dyn Timer>) -> Result<Self> {
        options.validate()?;

        let inner = Arc::new(ReconnectInner {
            socket,
            options,
            timer,
            events: SocketEvents::new(),
            reconnecting: Listeners::new(),
            state: Mutex::new(BackoffState {
                current_timeout: options.default_timeout,
                pending_timer: None,
                generation: 0,
                closed_by_user: false,
                close_delivered: false,
            }),
        });
        inner.subscribe();

        Ok(Self { inner })
    }

    /// Subscribes to "reconnecting".
    pub fn on_reconnecting<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReconnectingEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.reconnecting.add(listener)
    }

    /// Delay the next unexpected close will wait.
    #[must_use]
    pub fn current_timeout(&self) -> Duration {
        self.inner.state.lock().current_timeout
    }

    /// `true` while a reconnect is scheduled.
    #[must_use]
    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.state.lock().pending_timer.is_some()
    }

    /// Backoff configuration.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ReconnectOptions {
        &self.inner.options
    }

    /// The wrapped socket.
    #[inline]
    #[must_use]
    pub fn get_ref(&self) -> &S {
        &self.inner.socket
    }
}

impl<S: Socket> Socket for Reconnect<S> {
    fn url(&self) -> &str {
        self.inner.socket.url()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.socket.ready_state()
    }

    fn connect(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed_by_user = false;
            state.close_delivered = false;
        }
        self.inner.socket.connect();
    }

    fn send(&self, text: &str) {
        self.inner.socket.send(text);
    }

    fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let pending = {
            let mut state = inner.state.lock();
            state.closed_by_user = true;
            state.close_delivered = false;
            state.generation += 1;
            state.pending_timer.take()
        };

        if let Some(id) = pending {
            let cancelled = inner.timer.cancel(id);
            debug!(url = inner.socket.url(), %id, cancelled, "Pending reconnect cancelled");
        }

        inner.socket.close()?;

        // Between attempts the wrapped socket is already closed and stays silent.
        let delivered = inner.state.lock().close_delivered;
        if !delivered && inner.socket.ready_state() == ReadyState::Closed {
            inner.state.lock().close_delivered = true;
            return inner.events.emit_close(&CloseEvent::clean());
        }
        Ok(())
    }

    fn events(&self) -> &SocketEvents {
        &self.inner.events
    }
}

impl<S: Socket> ReconnectInner<S> {
    fn subscribe(self: &Arc<Self>) {
        let events = self.socket.events();

        let weak = Arc::downgrade(self);
        events.on_open(move || weak.upgrade().map_or(Ok(()), |inner| inner.on_socket_open()));

        let weak = Arc::downgrade(self);
        events.on_message(move |text| {
            weak.upgrade()
                .map_or(Ok(()), |inner| inner.events.emit_message(text))
        });

        let url = self.socket.url().to_string();
        events.on_error(move |err| {
            trace!(%url, error = %err, "Suppressed error, close follows");
            Ok(())
        });

        let weak = Arc::downgrade(self);
        events.on_close(move |event| {
            weak.upgrade()
                .map_or(Ok(()), |inner| inner.on_socket_close(event))
        });
    }

    fn on_socket_open(&self) -> Result<()> {
        self.state.lock().current_timeout = self.options.default_timeout;
        self.events.emit_open()
    }

    fn on_socket_close(self: &Arc<Self>, event: &CloseEvent) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            if state.closed_by_user {
                state.close_delivered = true;
                None
            } else {
                let delay = state.current_timeout;
                state.current_timeout = self.options.next_timeout(delay);
                Some(delay)
            }
        };

        let Some(delay) = delay else {
            return self.events.emit_close(event);
        };

        debug!(
            url = self.socket.url(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason = ?event.reason,
            "Connection lost, scheduling reconnect"
        );
        let notice = ReconnectingEvent {
            reason: event.reason.clone(),
            delay,
        };
        let delivered = self.events.dispatch(&self.reconnecting, &notice);

        if let Err(e) = self.schedule(delay) {
            warn!(url = self.socket.url(), error = %e, "Reconnect could not be scheduled");
            let reported = self.events.emit_error(&e);
            let closed = self.events.emit_close(event);
            return delivered.and(reported).and(closed);
        }
        delivered
    }

    fn schedule(self: &Arc<Self>, delay: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed_by_user {
            trace!("Closed while notifying, reconnect not scheduled");
            return Ok(());
        }
        if let Some(previous) = state.pending_timer.take() {
            self.timer.cancel(previous);
        }

        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(self);
        let id = self.timer.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timer(generation);
                }
            }),
        )?;
        state.pending_timer = Some(id);
        Ok(())
    }

    fn on_timer(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.closed_by_user {
                trace!(generation, "Stale reconnect timer");
                return;
            }
            state.pending_timer = None;
        }
        debug!(url = self.socket.url(), "Reconnecting");
        self.socket.connect();
    }
}

// ============================================================================
// Tests
// ============================================================================
