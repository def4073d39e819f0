//! The event feed: a bounded, sequence-numbered log of recent status events
//! plus the long-poll machinery readers use to catch up on it.
//!
//! `Feed` owns both shared pieces of state (the [`EventLog`] and the
//! [`WaiterRegistry`]) and is injected into request handlers as an
//! `Arc<Feed>`. Publishing appends first and wakes second, so a waiter is
//! never told about an event that is not yet visible in the log.

/// Sequence numbers, events and wake reasons.
pub mod event;
/// Bounded event ring.
pub mod log;
/// Catch-up / block / reload decision and response composition.
pub mod reconcile;
/// Pending long-poll waiters.
pub mod waiters;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::FeedConfig;

pub use event::{Event, EvqStatus, SequenceNumber, Wake};
pub use log::{EventLog, LogView};
pub use reconcile::{decide, Decision, UpdateResponse};
pub use waiters::{PendingWaiter, WaitOutcome, WaiterCounters, WaiterId, WaiterRegistry};

/// Point-in-time feed counters, served on the stats endpoint.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub evq: EvqStatus,
    pub appended: u64,
    pub reloads: u64,
    pub waiters: usize,
    pub registered: u64,
    pub woken: u64,
    pub timed_out: u64,
    pub canceled: u64,
}

/// Event log + waiter registry.
#[derive(Debug)]
pub struct Feed {
    log: EventLog,
    waiters: WaiterRegistry,
    initial: SequenceNumber,
    poll_timeout: Duration,
    // Bumped before every reload wake cycle; parked readers compare it.
    reloads: AtomicU64,
    closed: AtomicBool,
}

impl Default for Feed {
    fn default() -> Self {
        Self::new(&FeedConfig::default())
    }
}

impl Feed {
    /// An empty feed configured by `cfg`.
    #[must_use]
    pub fn new(cfg: &FeedConfig) -> Self {
        Self {
            log: EventLog::new(cfg.retention, cfg.initial()),
            waiters: WaiterRegistry::new(),
            initial: cfg.initial(),
            poll_timeout: cfg.poll_timeout(),
            reloads: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Append an event and wake every parked reader.
    pub fn publish(&self, payload: serde_json::Value) -> SequenceNumber {
        let seq = self.log.append(payload);
        let woken = self.waiters.wake_all(Wake::Advanced(seq));
        tracing::debug!(%seq, woken, "event appended");
        seq
    }

    /// Tell every parked reader to drop its diff state and reload.
    ///
    /// Consumes no sequence number and leaves the log untouched.
    pub fn broadcast_reload(&self) -> usize {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        let woken = self.waiters.wake_all(Wake::Reload);
        tracing::info!(woken, "reload broadcast");
        woken
    }

    /// Stop parking readers: release every parked one with a reload, and
    /// answer later current readers with a reload instead of parking them.
    ///
    /// Appends still work. Irreversible.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.broadcast_reload()
    }

    /// True once [`Feed::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of reload broadcasts so far. Changes whenever parked readers
    /// were told to reload.
    #[must_use]
    pub fn reload_generation(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Current `{seq, len}`.
    #[must_use]
    pub fn status(&self) -> EvqStatus {
        self.log.status()
    }

    /// The underlying event log.
    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    /// The parked-reader registry.
    #[must_use]
    pub const fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }

    /// The initial counter value, which doubles as the "unknown cursor" value.
    #[must_use]
    pub const fn sentinel(&self) -> SequenceNumber {
        self.initial
    }

    /// How long a current reader stays parked.
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Counters for the stats endpoint.
    #[must_use]
    pub fn stats(&self) -> FeedStats {
        let c = self.waiters.counters();
        FeedStats {
            evq: self.log.status(),
            appended: self.log.appended(),
            reloads: self.reload_generation(),
            waiters: self.waiters.len(),
            registered: c.registered,
            woken: c.woken,
            timed_out: c.timed_out,
            canceled: c.canceled,
        }
    }
}
