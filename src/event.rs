//! Cancellation and timing primitives
//!
//! [`EventFlag`] is a manual-reset async boolean used for stop coordination;
//! [`Stopwatch`] drives the flush cadence and speed sampling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Manual-reset event usable from any task.
///
/// `set` wakes all current and future waiters until `unset` clears the flag
/// again. Suitable for one-shot cancellation signals that may be reused
/// across runs.
#[derive(Debug, Default)]
pub struct EventFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl EventFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clear the flag. Subsequent `wait` calls block until the next `set`.
    pub fn unset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until the flag is set, up to `timeout`.
    ///
    /// Returns `true` iff the flag was observed set before the timeout
    /// elapsed.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before the re-check so a concurrent `set`
            // between the two cannot be missed.
            let notified = self.notify.notified();
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return self.is_set();
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.is_set();
            }
            if self.is_set() {
                return true;
            }
        }
    }
}

/// The pair of stop signals a run observes: the engine's internal flag and
/// the caller-supplied one.
#[derive(Clone, Default)]
pub(crate) struct StopToken {
    pub internal: std::sync::Arc<EventFlag>,
    pub user: Option<std::sync::Arc<EventFlag>>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.internal.is_set() || self.user.as_ref().is_some_and(|e| e.is_set())
    }

    /// Wait up to `timeout` for either signal; returns true iff stopped.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        // The user flag has no waiter registration here, so poll it at a
        // 50ms granularity while waiting on the internal flag.
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.is_stopped();
            }
            let step = (deadline - now).min(Duration::from_millis(50));
            if self.internal.wait(step).await || self.is_stopped() {
                return true;
            }
        }
    }

    /// Resolve only once a stop is requested.
    pub async fn stopped(&self) {
        while !self.wait(Duration::from_millis(50)).await {}
    }
}

/// Monotonic stopwatch.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn restart(&mut self) {
        self.started = Instant::now();
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}
