//! Registry of pending long-poll waiters.
//!
//! Every registered waiter reaches exactly one terminal state: woken, timed
//! out, or canceled. The registry enforces this: an entry is removed from the
//! pending map exactly once, and whoever removes it owns the transition.
//! `wake_all` swaps the whole map out under the lock and notifies outside it,
//! so a notification that re-registers lands in the next wake cycle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::event::Wake;

/// Handle identifying a registered waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(u64);

impl fmt::Display for WaiterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Terminal state reached by a pending waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A wake cycle delivered this notification.
    Woken(Wake),
    /// The deadline passed before any wake cycle.
    TimedOut,
    /// The waiter was canceled through the registry while waiting.
    Canceled,
}

enum Notify {
    Channel(oneshot::Sender<Wake>),
    Callback(Box<dyn FnOnce(Wake) + Send>),
}

impl Notify {
    fn fire(self, wake: Wake) {
        match self {
            // The receiver may have been dropped by an abandoned request.
            Self::Channel(tx) => {
                let _ = tx.send(wake);
            }
            Self::Callback(f) => f(wake),
        }
    }
}

/// Snapshot of the registry's lifetime counters.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaiterCounters {
    pub registered: u64,
    pub woken: u64,
    pub timed_out: u64,
    pub canceled: u64,
}

/// Single-use waiter registry.
pub struct WaiterRegistry {
    next_id: AtomicU64,
    pending: Mutex<HashMap<WaiterId, Notify>>,
    registered: AtomicU64,
    woken: AtomicU64,
    timed_out: AtomicU64,
    canceled: AtomicU64,
}

impl fmt::Debug for WaiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterRegistry")
            .field("pending", &self.len())
            .field("counters", &self.counters())
            .finish()
    }
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            registered: AtomicU64::new(0),
            woken: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WaiterId, Notify>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, notify: Notify) -> WaiterId {
        let id = WaiterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, notify);
        self.registered.fetch_add(1, Ordering::Relaxed);
        id
    }

    fn take(&self, id: WaiterId) -> Option<Notify> {
        self.lock().remove(&id)
    }

    /// Register a waiter backed by a one-shot channel.
    ///
    /// Dropping the returned handle before it settles cancels it.
    pub fn register(&self) -> PendingWaiter<'_> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(Notify::Channel(tx));
        PendingWaiter {
            registry: self,
            id,
            rx,
            settled: false,
        }
    }

    /// Register a callback invoked at most once, on the next wake cycle.
    ///
    /// The callback runs outside the registry lock and may register again.
    pub fn register_fn<F>(&self, notify: F) -> WaiterId
    where
        F: FnOnce(Wake) + Send + 'static,
    {
        self.insert(Notify::Callback(Box::new(notify)))
    }

    /// Notify every currently registered waiter exactly once and clear the
    /// registry. Returns the number of waiters notified.
    pub fn wake_all(&self, wake: Wake) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let n = drained.len();
        self.woken.fetch_add(n as u64, Ordering::Relaxed);
        tracing::trace!(waiters = n, ?wake, "wake cycle");
        for (_, notify) in drained {
            notify.fire(wake);
        }
        n
    }

    /// Remove a waiter before it fires. Idempotent: returns false if the
    /// waiter already fired, timed out or was canceled.
    pub fn cancel(&self, id: WaiterId) -> bool {
        if self.take(id).is_some() {
            self.canceled.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn claim_timeout(&self, id: WaiterId) -> bool {
        if self.take(id).is_some() {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Number of waiters currently pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if no waiter is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lifetime registered / woken / timed-out / canceled counts.
    #[must_use]
    pub fn counters(&self) -> WaiterCounters {
        WaiterCounters {
            registered: self.registered.load(Ordering::Relaxed),
            woken: self.woken.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
        }
    }
}

/// A registered, not yet settled waiter.
#[derive(Debug)]
#[must_use = "dropping a PendingWaiter cancels it"]
pub struct PendingWaiter<'a> {
    registry: &'a WaiterRegistry,
    id: WaiterId,
    rx: oneshot::Receiver<Wake>,
    settled: bool,
}

impl PendingWaiter<'_> {
    /// The handle usable with [`WaiterRegistry::cancel`].
    pub const fn id(&self) -> WaiterId {
        self.id
    }

    /// Wait for the next wake cycle or until `deadline`, whichever is first.
    pub async fn wait_until(mut self, deadline: Instant) -> WaitOutcome {
        let outcome = match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(Ok(wake)) => WaitOutcome::Woken(wake),
            Ok(Err(_)) => WaitOutcome::Canceled,
            Err(_) => {
                if self.registry.claim_timeout(self.id) {
                    WaitOutcome::TimedOut
                } else {
                    // A wake cycle already owns this waiter; its send is
                    // imminent (or done), so this resolves without blocking.
                    match (&mut self.rx).await {
                        Ok(wake) => WaitOutcome::Woken(wake),
                        Err(_) => WaitOutcome::Canceled,
                    }
                }
            }
        };
        self.settled = true;
        outcome
    }

    /// Cancel explicitly. Equivalent to dropping the handle.
    pub fn cancel(mut self) -> bool {
        self.settled = true;
        self.registry.cancel(self.id)
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.cancel(self.id);
        }
    }
}
