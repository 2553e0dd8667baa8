//! Connection pool keyed by URL.
//!
//! Every [`Pool::create`] call returns a fresh [`PoolHandle`]. Handles for
//! the same URL share one physical socket; the socket is closed only when
//! the last connected handle closes.
//!
//! # Close Accounting
//!
//! | Handle closes while | Physical socket | Close event |
//! |---------------------|-----------------|-------------|
//! | other handles remain | untouched | to this handle, immediately |
//! | it is the last one | closed | to this handle, when the socket closes |
//! | it never connected | untouched | to this handle, immediately |
//!
//! A handle never sees a close caused by another handle leaving.
//! A handle that joins while the socket is still closing for the last
//! departed handle reconnects it once that close completes.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::{CloseEvent, SocketEvents};
use crate::identifiers::ListenerId;
use crate::websocket::{ReadyState, Socket, WebSocket};

// ============================================================================
// Types
// ============================================================================

/// Creates the physical socket for a URL.
type SocketFactory<S> = Box<dyn Fn(&str) -> Result<S> + Send + Sync>;

/// One physical socket and its reference count.
struct PooledEntry<S> {
    socket: S,
    ref_count: usize,
}

// ============================================================================
// Pool
// ============================================================================

/// Registry of shared sockets keyed by URL.
///
/// # Example
///
/// ```ignore
/// use draft76_client::{Pool, Socket};
///
/// let pool = Pool::new();
/// let a = pool.create("ws://example.com/feed")?;
/// let b = pool.create("ws://example.com/feed")?;
/// a.connect();
/// b.connect();
///
/// a.close()?; // b stays connected
/// b.close()?; // physical socket closes
/// ```
pub struct Pool<S: Socket + Clone = WebSocket> {
    inner: Arc<PoolInner<S>>,
}

struct PoolInner<S> {
    factory: SocketFactory<S>,
    entries: Mutex<FxHashMap<String, PooledEntry<S>>>,
}

impl<S: Socket + Clone> Clone for Pool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Socket + Clone> fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for Pool<WebSocket> {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool<WebSocket> {
    /// Creates a pool of TCP [`WebSocket`]s.
    #[must_use]
    pub fn new() -> Self {
        Self::with_factory(WebSocket::new)
    }
}

impl<S: Socket + Clone> Pool<S> {
    /// Creates a pool that builds physical sockets with `factory`.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&str) -> Result<S> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                factory: Box::new(factory),
                entries: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Returns a new handle onto the socket for `url`, creating the socket if
    /// this is the first request for `url`.
    ///
    /// The handle does not count as a user of the socket until it connects.
    ///
    /// # Errors
    ///
    /// Whatever the factory returns for a new URL, e.g.
    /// [`Error::Syntax`](crate::Error::Syntax).
    pub fn create(&self, url: &str) -> Result<PoolHandle<S>> {
        let existing = self
            .inner
            .entries
            .lock()
            .get(url)
            .map(|entry| entry.socket.clone());

        let socket = match existing {
            Some(socket) => socket,
            None => {
                let created = (self.inner.factory)(url)?;
                let mut entries = self.inner.entries.lock();
                let entry = entries.entry(url.to_string()).or_insert_with(|| {
                    debug!(url, "Pool entry created");
                    PooledEntry {
                        socket: created,
                        ref_count: 0,
                    }
                });
                entry.socket.clone()
            }
        };

        Ok(PoolHandle::new(url, socket, Arc::clone(&self.inner)))
    }

    /// Number of URLs with a pooled socket.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// `true` if no socket has been pooled yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Number of connected handles for `url`.
    #[must_use]
    pub fn ref_count(&self, url: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(url)
            .map_or(0, |entry| entry.ref_count)
    }
}

impl<S> PoolInner<S> {
    /// Counts a handle in. Returns the new count.
    fn join(&self, url: &str) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(url) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.ref_count
            }
            None => {
                error!(url, "Join on missing pool entry");
                0
            }
        }
    }

    /// Counts a handle out. Returns the remaining count.
    fn leave(&self, url: &str) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(url) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count
            }
            None => 0,
        }
    }
}

// ============================================================================
// PoolHandle
// ============================================================================

/// Where a handle stands relative to its pooled socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    /// Created, never connected.
    Idle,
    /// Counted in and receiving events.
    Joined,
    /// Last handle out; waiting for the physical close.
    Leaving,
    /// Closed.
    Left,
}

/// A caller's view of a pooled socket.
///
/// Forwards open, message, and error from the shared socket. Close is
/// delivered only when it concerns this handle.
pub struct PoolHandle<S: Socket + Clone = WebSocket> {
    inner: Arc<HandleInner<S>>,
}

struct HandleInner<S: Socket + Clone> {
    url: String,
    socket: S,
    pool: Arc<PoolInner<S>>,
    events: SocketEvents,
    state: Mutex<HandleState>,
}

struct HandleState {
    membership: Membership,
    subscriptions: Vec<ListenerId>,
    /// Joined while the shared socket was still closing for another handle.
    reopen_pending: bool,
}

impl<S: Socket + Clone> Clone for PoolHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Socket + Clone> fmt::Debug for PoolHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("url", &self.inner.url)
            .field("membership", &self.inner.state.lock().membership)
            .finish_non_exhaustive()
    }
}

impl<S: Socket + Clone> PoolHandle<S> {
    fn new(url: &str, socket: S, pool: Arc<PoolInner<S>>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                url: url.to_string(),
                socket,
                pool,
                events: SocketEvents::new(),
                state: Mutex::new(HandleState {
                    membership: Membership::Idle,
                    subscriptions: Vec::new(),
                    reopen_pending: false,
                }),
            }),
        }
    }

    /// The shared physical socket.
    #[inline]
    #[must_use]
    pub fn socket(&self) -> &S {
        &self.inner.socket
    }
}

impl<S: Socket + Clone> Socket for PoolHandle<S> {
    fn url(&self) -> &str {
        &self.inner.url
    }

    fn ready_state(&self) -> ReadyState {
        let state = self.inner.state.lock();
        match state.membership {
            Membership::Idle => ReadyState::Connecting,
            Membership::Joined if state.reopen_pending => ReadyState::Connecting,
            Membership::Joined => self.inner.socket.ready_state(),
            Membership::Leaving => ReadyState::Closing,
            Membership::Left => ReadyState::Closed,
        }
    }

    fn connect(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            let membership = state.membership;
            match membership {
                Membership::Joined => {
                    drop(state);
                    inner.socket.connect();
                    return;
                }
                Membership::Leaving => {
                    debug!(url = %inner.url, "Connect ignored while leaving");
                    return;
                }
                Membership::Idle | Membership::Left => {}
            }
            state.membership = Membership::Joined;
            state.reopen_pending = inner.socket.ready_state() == ReadyState::Closing;
            state.subscriptions = inner.subscribe();
        }

        let refs = inner.pool.join(&inner.url);
        debug!(url = %inner.url, refs, "Handle joined pool");
        inner.socket.connect();

        if inner.socket.is_open() {
            debug!(url = %inner.url, "Socket already open, synthesizing open");
            if let Err(e) = inner.events.emit_open() {
                error!(url = %inner.url, error = %e, "Error listener failed");
            }
        }
    }

    fn send(&self, text: &str) {
        if self.inner.state.lock().membership == Membership::Joined {
            self.inner.socket.send(text);
        } else {
            warn!(url = %self.inner.url, "Dropping send on handle that is not connected");
        }
    }

    fn close(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            let membership = state.membership;
            match membership {
                Membership::Leaving | Membership::Left => return Ok(()),
                Membership::Idle => {
                    state.membership = Membership::Left;
                    drop(state);
                    return inner.events.emit_close(&CloseEvent::clean());
                }
                Membership::Joined => state.membership = Membership::Leaving,
            }
        }

        let remaining = inner.pool.leave(&inner.url);
        if remaining > 0 || inner.socket.ready_state() == ReadyState::Closed {
            debug!(url = %inner.url, remaining, "Handle left pool");
            inner.detach();
            return inner.events.emit_close(&CloseEvent::clean());
        }

        debug!(url = %inner.url, "Last handle left pool, closing socket");
        inner.socket.close()
    }

    fn events(&self) -> &SocketEvents {
        &self.inner.events
    }
}

impl<S: Socket + Clone> HandleInner<S> {
    /// Forwards socket events to this handle.
    fn subscribe(self: &Arc<Self>) -> Vec<ListenerId> {
        let events = self.socket.events();

        let weak = Arc::downgrade(self);
        let open = events.on_open(move || match weak.upgrade() {
            Some(handle) if handle.is_listening(false) => handle.events.emit_open(),
            _ => Ok(()),
        });

        let weak = Arc::downgrade(self);
        let message = events.on_message(move |text| match weak.upgrade() {
            Some(handle) if handle.is_listening(false) => handle.events.emit_message(text),
            _ => Ok(()),
        });

        let weak = Arc::downgrade(self);
        let error = events.on_error(move |err| match weak.upgrade() {
            Some(handle) if handle.is_listening(true) => handle.events.emit_error(err),
            _ => Ok(()),
        });

        let weak = Arc::downgrade(self);
        let close = events.on_close(move |event| {
            weak.upgrade()
                .map_or(Ok(()), |handle| handle.on_socket_close(event))
        });

        vec![open, message, error, close]
    }

    /// Whether events from the current physical connection reach this handle.
    ///
    /// A leaving handle still hears errors that precede its close.
    fn is_listening(&self, while_leaving: bool) -> bool {
        let state = self.state.lock();
        match state.membership {
            Membership::Joined => !state.reopen_pending,
            Membership::Leaving => while_leaving,
            Membership::Idle | Membership::Left => false,
        }
    }

    fn on_socket_close(&self, event: &CloseEvent) -> Result<()> {
        let membership = {
            let mut state = self.state.lock();
            if state.membership == Membership::Joined && state.reopen_pending {
                state.reopen_pending = false;
                None
            } else {
                Some(state.membership)
            }
        };

        let Some(membership) = membership else {
            debug!(url = %self.url, "Previous connection closed, reconnecting for late joiner");
            self.socket.connect();
            return Ok(());
        };

        match membership {
            Membership::Joined => self.events.emit_close(event),
            Membership::Leaving => {
                self.detach();
                self.events.emit_close(event)
            }
            Membership::Idle | Membership::Left => Ok(()),
        }
    }

    /// Marks the handle closed and stops forwarding.
    fn detach(&self) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.membership = Membership::Left;
            std::mem::take(&mut state.subscriptions)
        };
        let events = self.socket.events();
        for id in subscriptions {
            events.remove_listener(id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;
    use crate::protocol::frame::CLOSING_FRAME;
    use crate::testing::{MockTransportFactory, Recorder, Seen, init_tracing};

    const URL: &str = "ws://example.com/feed";

    fn pool() -> (Pool<WebSocket>, Arc<MockTransportFactory>) {
        init_tracing();
        let factory = MockTransportFactory::new();
        let transports = Arc::clone(&factory);
        let pool = Pool::with_factory(move |url| WebSocket::with_transport(url, transports.clone()));
        (pool, factory)
    }

    fn handle(pool: &Pool<WebSocket>) -> (PoolHandle<WebSocket>, Arc<Recorder>) {
        let handle = pool.create(URL).expect("valid url");
        let recorder = Recorder::attach(handle.events());
        (handle, recorder)
    }

    #[test]
    fn test_same_url_shares_socket() {
        let (pool, _) = pool();
        let (a, _) = handle(&pool);
        let (b, _) = handle(&pool);
        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&a.inner.pool, &b.inner.pool));
        assert_eq!(a.socket().url(), b.socket().url());
    }

    #[test]
    fn test_factory_runs_once_per_url() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let factory = MockTransportFactory::new();
        let pool = Pool::with_factory(move |url| {
            seen.lock().push(url.to_string());
            WebSocket::with_transport(url, factory.clone())
        });

        pool.create(URL).expect("valid");
        pool.create(URL).expect("valid");
        pool.create("ws://example.com/other").expect("valid");
        assert_eq!(*calls.lock(), vec![URL, "ws://example.com/other"]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_invalid_url() {
        let (pool, _) = pool();
        let err = pool.create("http://example.com").expect_err("rejected");
        assert!(matches!(err, Error::Syntax { .. }));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_connect_counts_and_opens_once() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let (b, rb) = handle(&pool);

        a.connect();
        b.connect();
        assert_eq!(pool.ref_count(URL), 2);
        assert_eq!(factory.count(), 1);

        factory.last().accept(URL).expect("emit");
        assert_eq!(ra.seen(), vec![Seen::Open]);
        assert_eq!(rb.seen(), vec![Seen::Open]);
        assert_eq!(a.ready_state(), ReadyState::Open);
    }

    #[test]
    fn test_late_joiner_gets_synthesized_open() {
        let (pool, factory) = pool();
        let (a, _) = handle(&pool);
        a.connect();
        factory.last().accept(URL).expect("emit");

        let (b, rb) = handle(&pool);
        b.connect();
        assert_eq!(rb.seen(), vec![Seen::Open]);
        assert_eq!(factory.count(), 1);
    }

    #[test]
    fn test_messages_fan_out() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let (b, rb) = handle(&pool);
        a.connect();
        b.connect();
        factory.last().accept(URL).expect("emit");

        factory.last().fire_data(&[0x00, b'x', 0xff]).expect("emit");
        assert_eq!(ra.count(&Seen::Message("x".into())), 1);
        assert_eq!(rb.count(&Seen::Message("x".into())), 1);
    }

    #[test]
    fn test_send_forwards() {
        let (pool, factory) = pool();
        let (a, _) = handle(&pool);
        a.connect();
        let transport = factory.last();
        transport.accept(URL).expect("emit");

        a.send("foo");
        assert_eq!(transport.take_written(), vec![0x00, b'f', b'o', b'o', 0xff]);
    }

    #[test]
    fn test_close_with_other_handles_remaining() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let (b, rb) = handle(&pool);
        a.connect();
        b.connect();
        let transport = factory.last();
        transport.accept(URL).expect("emit");
        ra.clear();
        rb.clear();

        a.close().expect("close");
        assert_eq!(ra.seen(), vec![Seen::Close { was_clean: true }]);
        assert!(rb.seen().is_empty());
        assert!(transport.written().is_empty());
        assert_eq!(pool.ref_count(URL), 1);
        assert_eq!(a.ready_state(), ReadyState::Closed);
        assert_eq!(b.ready_state(), ReadyState::Open);

        // The departed handle no longer hears the socket.
        transport.fire_data(&[0x00, b'x', 0xff]).expect("emit");
        assert!(ra.seen().len() == 1);
        assert_eq!(rb.seen(), vec![Seen::Message("x".into())]);
    }

    #[test]
    fn test_last_close_closes_socket() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let (b, rb) = handle(&pool);
        a.connect();
        b.connect();
        let transport = factory.last();
        transport.accept(URL).expect("emit");

        a.close().expect("close");
        b.close().expect("close");
        assert_eq!(pool.ref_count(URL), 0);
        assert_eq!(transport.take_written(), CLOSING_FRAME.to_vec());
        assert_eq!(b.ready_state(), ReadyState::Closing);
        assert_eq!(rb.closes(), 0);

        transport.fire_data(&CLOSING_FRAME).expect("emit");
        assert_eq!(rb.closes(), 1);
        assert_eq!(ra.closes(), 1);
        assert_eq!(b.ready_state(), ReadyState::Closed);

        transport.fire_close(false).expect("emit");
        assert_eq!(rb.closes(), 1);
    }

    #[test]
    fn test_physical_close_reaches_joined_handles() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let (b, rb) = handle(&pool);
        a.connect();
        b.connect();
        factory.last().accept(URL).expect("emit");

        factory.last().fire_close(true).expect("emit");
        assert_eq!(ra.count(&Seen::Close { was_clean: false }), 1);
        assert_eq!(rb.count(&Seen::Close { was_clean: false }), 1);
        assert_eq!(pool.ref_count(URL), 2);

        // Both still joined: the socket can be re-used.
        a.connect();
        assert_eq!(factory.count(), 2);
    }

    #[test]
    fn test_last_close_on_closed_socket_emits_immediately() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        a.connect();
        factory.last().accept(URL).expect("emit");
        factory.last().fire_close(false).expect("emit");
        ra.clear();

        a.close().expect("close");
        assert_eq!(ra.seen(), vec![Seen::Close { was_clean: true }]);
        assert_eq!(pool.ref_count(URL), 0);
    }

    #[test]
    fn test_close_without_connect() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        a.close().expect("close");
        assert_eq!(ra.seen(), vec![Seen::Close { was_clean: true }]);
        assert_eq!(factory.count(), 0);

        a.close().expect("close");
        assert_eq!(ra.closes(), 1);
    }

    #[test]
    fn test_rejoin_after_close() {
        let (pool, factory) = pool();
        let (a, _) = handle(&pool);
        let (b, _) = handle(&pool);
        a.connect();
        b.connect();
        factory.last().accept(URL).expect("emit");

        a.close().expect("close");
        a.connect();
        assert_eq!(pool.ref_count(URL), 2);
    }

    #[test]
    fn test_closed_handle_misses_in_flight_message() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let (b, _) = handle(&pool);
        b.connect();
        a.connect();

        let leaver = a.clone();
        b.on_message(move |_| leaver.close());
        factory.last().accept(URL).expect("emit");

        factory.last().fire_data(&[0x00, b'x', 0xff]).expect("emit");
        assert_eq!(ra.seen(), vec![Seen::Open, Seen::Close { was_clean: true }]);
        assert_eq!(pool.ref_count(URL), 1);
    }

    #[test]
    fn test_join_while_last_handle_leaving() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        a.connect();
        let transport = factory.last();
        transport.accept(URL).expect("emit");
        a.close().expect("close");

        let (b, rb) = handle(&pool);
        b.connect();
        assert_eq!(b.ready_state(), ReadyState::Connecting);
        assert_eq!(factory.count(), 1);

        // The closing connection belongs to A alone.
        transport.fire_data(&CLOSING_FRAME).expect("emit");
        assert_eq!(ra.seen(), vec![Seen::Open, Seen::Close { was_clean: true }]);
        assert!(rb.seen().is_empty());
        assert_eq!(factory.count(), 2);
        assert_eq!(b.ready_state(), ReadyState::Connecting);

        factory.last().accept(URL).expect("emit");
        assert_eq!(rb.seen(), vec![Seen::Open]);
        assert_eq!(pool.ref_count(URL), 1);
        assert_eq!(b.ready_state(), ReadyState::Open);
    }

    #[test]
    fn test_remove_listener() {
        let (pool, factory) = pool();
        let (a, ra) = handle(&pool);
        let id = a.on_message(|_| Err(Error::callback("removed")));
        assert!(a.remove_listener(id));

        a.connect();
        factory.last().accept(URL).expect("emit");
        factory.last().fire_data(&[0x00, b'x', 0xff]).expect("emit");
        assert_eq!(ra.seen(), vec![Seen::Open, Seen::Message("x".into())]);
    }
}
