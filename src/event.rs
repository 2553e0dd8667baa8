//! Typed event listeners.
//!
//! Every socket-like type in this crate owns a [`SocketEvents`] and exposes
//! typed `on_*` subscription methods instead of string-keyed dispatch.
//!
//! # Listener Isolation
//!
//! Listeners return [`Result<()>`]. When an open, message, or close listener
//! fails, its error is re-delivered once as an "error" event on the same
//! object and the remaining listeners still run. When an error listener
//! fails, the failure is returned to whoever emitted the event.
//!
//! Emission never holds a lock while a listener runs, so listeners may
//! subscribe, unsubscribe, or drive the socket re-entrantly.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identifiers::ListenerId;

// ============================================================================
// CloseEvent
// ============================================================================

/// Payload of a "close" event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseEvent {
    /// `true` for a completed closing handshake or an error-free transport close.
    pub was_clean: bool,
    /// Why the connection closed, when known.
    pub reason: Option<String>,
    /// Close code, when the peer supplied one.
    pub code: Option<u16>,
}

impl CloseEvent {
    /// Creates a close event.
    #[inline]
    #[must_use]
    pub fn new(was_clean: bool, reason: Option<String>, code: Option<u16>) -> Self {
        Self {
            was_clean,
            reason,
            code,
        }
    }

    /// A clean close with no reason or code.
    #[inline]
    #[must_use]
    pub fn clean() -> Self {
        Self::new(true, None, None)
    }

    /// An unclean close with a reason.
    #[inline]
    #[must_use]
    pub fn unclean(reason: impl Into<String>) -> Self {
        Self::new(false, Some(reason.into()), None)
    }
}

// ============================================================================
// ReconnectingEvent
// ============================================================================

/// Payload of a "reconnecting" event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectingEvent {
    /// Reason carried by the close that triggered the reconnect.
    pub reason: Option<String>,
    /// Delay before the next connect attempt.
    pub delay: Duration,
}

// ============================================================================
// Listeners
// ============================================================================

/// Registry of listeners for one event kind.
///
/// `A` is the event payload; listeners receive it by reference.
pub struct Listeners<A: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<dyn Fn(&A) -> Result<()> + Send + Sync>)>>,
}

impl<A: ?Sized> Default for Listeners<A> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<A: ?Sized> Listeners<A> {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&A) -> Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        let listener: Arc<dyn Fn(&A) -> Result<()> + Send + Sync> = Arc::new(listener);
        self.entries.lock().push((id, listener));
        id
    }

    /// Removes a listener. Returns `true` if it was registered here.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no listener is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Calls every listener in registration order, stopping at the first error.
    ///
    /// The listener list is copied before any listener runs.
    pub fn emit(&self, arg: &A) -> Result<()> {
        for listener in self.snapshot() {
            listener(arg)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Fn(&A) -> Result<()> + Send + Sync>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

// ============================================================================
// SocketEvents
// ============================================================================

/// The public event surface of a socket: open, message, close, and error.
#[derive(Default)]
pub struct SocketEvents {
    open: Listeners<()>,
    message: Listeners<str>,
    close: Listeners<CloseEvent>,
    error: Listeners<Error>,
}

impl SocketEvents {
    /// Creates an event surface with no listeners.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to "open".
    pub fn on_open<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.open.add(move |_: &()| listener())
    }

    /// Subscribes to "message".
    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) -> Result<()> + Send + Sync + 'static,
    {
        self.message.add(listener)
    }

    /// Subscribes to "close".
    pub fn on_close<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&CloseEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.close.add(listener)
    }

    /// Subscribes to "error".
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Error) -> Result<()> + Send + Sync + 'static,
    {
        self.error.add(listener)
    }

    /// Removes a listener of any kind. Returns `true` if it was found.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.open.remove(id)
            || self.message.remove(id)
            || self.close.remove(id)
            || self.error.remove(id)
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.open.clear();
        self.message.clear();
        self.close.clear();
        self.error.clear();
    }

    /// Returns the total number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.open.len() + self.message.len() + self.close.len() + self.error.len()
    }

    /// Emits "open".
    pub fn emit_open(&self) -> Result<()> {
        self.dispatch(&self.open, &())
    }

    /// Emits "message".
    pub fn emit_message(&self, text: &str) -> Result<()> {
        self.dispatch(&self.message, text)
    }

    /// Emits "close".
    pub fn emit_close(&self, event: &CloseEvent) -> Result<()> {
        self.dispatch(&self.close, event)
    }

    /// Emits "error".
    ///
    /// A failing error listener aborts the emission and its error is returned.
    /// With no error listeners the error is logged and dropped.
    pub fn emit_error(&self, err: &Error) -> Result<()> {
        if self.error.is_empty() {
            warn!(error = %err, "Unhandled error event");
            return Ok(());
        }
        self.error.emit(err)
    }

    /// Runs `listeners` with `arg`, re-delivering each listener failure as
    /// an "error" event.
    pub fn dispatch<A: ?Sized>(&self, listeners: &Listeners<A>, arg: &A) -> Result<()> {
        for listener in listeners.snapshot() {
            if let Err(err) = listener(arg) {
                debug!(error = %err, "Listener failed");
                self.emit_error(&err)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
