//! One-shot timers.
//!
//! [`Timer`] is the seam reconnect scheduling goes through, so tests can
//! drive time by hand. [`TokioTimer`] is the runtime implementation.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::{Error, Result};
use crate::identifiers::TimerId;

// ============================================================================
// Timer
// ============================================================================

/// Callback run when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot callbacks.
///
/// Implementations must never run `callback` synchronously from inside
/// `schedule`, and must never run it after a successful `cancel`.
pub trait Timer: Send + Sync {
    /// Runs `callback` once after `delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer cannot be armed. `callback` is dropped
    /// without running.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId>;

    /// Cancels a pending timer. Returns `false` if it already fired or was
    /// never scheduled.
    fn cancel(&self, id: TimerId) -> bool;
}

// ============================================================================
// TokioTimer
// ============================================================================

/// Timer backed by `tokio::time::sleep` tasks.
#[derive(Debug, Clone, Default)]
pub struct TokioTimer {
    tasks: Arc<Mutex<FxHashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioTimer {
    /// Creates a timer with no pending tasks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of timers that have neither fired nor been cancelled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> Result<TimerId> {
        let handle = Handle::try_current()
            .map_err(|e| Error::config(format!("no tokio runtime for timer: {e}")))?;
        let id = TimerId::next();

        // Held across spawn so the task cannot look itself up before insert.
        let mut tasks = self.tasks.lock();
        let registry = Arc::clone(&self.tasks);
        let join = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if registry.lock().remove(&id).is_some() {
                trace!(%id, "Timer fired");
                callback();
            }
        });
        tasks.insert(id, join);

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        trace!(%id, delay_ms, "Timer scheduled");
        Ok(id)
    }

    fn cancel(&self, id: TimerId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(join) => {
                join.abort();
                trace!(%id, "Timer cancelled");
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
