//! Bounded, sequence-numbered ring of recent events.
//!
//! The log keeps the `retention` most recent events, contiguous in sequence
//! number and ordered oldest to newest. It owns the sequence counter; the
//! counter and the buffer live under one lock so a reader can never observe a
//! sequence increment without the matching event already being in the buffer.

use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::event::{Event, EvqStatus, SequenceNumber};

#[derive(Debug)]
struct Ring {
    events: VecDeque<Event>,
    current: SequenceNumber,
    appended: u64,
}

/// Append-only event log with a fixed retention window.
#[derive(Debug)]
pub struct EventLog {
    retention: usize,
    ring: RwLock<Ring>,
}

impl EventLog {
    /// Create a log retaining at most `retention` events (minimum 1), whose
    /// counter starts at `initial`.
    #[must_use]
    pub fn new(retention: usize, initial: SequenceNumber) -> Self {
        let retention = retention.max(1);
        Self {
            retention,
            ring: RwLock::new(Ring {
                events: VecDeque::with_capacity(retention),
                current: initial,
                appended: 0,
            }),
        }
    }

    // Writers never leave the ring half-updated, so a poisoned lock still
    // guards consistent state.
    fn read(&self) -> RwLockReadGuard<'_, Ring> {
        self.ring.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ring> {
        self.ring.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next sequence number to `payload`, store it, evict the
    /// oldest entry if the window is exceeded, and return the assigned number.
    pub fn append(&self, payload: serde_json::Value) -> SequenceNumber {
        let mut ring = self.write();
        let seq = ring.current.next();
        ring.events.push_back(Event::new(seq, payload));
        while ring.events.len() > self.retention {
            ring.events.pop_front();
        }
        ring.current = seq;
        ring.appended += 1;
        seq
    }

    /// Sequence number of the most recently appended event, or the initial
    /// value if nothing was appended yet.
    #[must_use]
    pub fn current_sequence(&self) -> SequenceNumber {
        self.read().current
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().events.len()
    }

    /// True if nothing was appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().events.is_empty()
    }

    /// Maximum number of retained events.
    #[must_use]
    pub const fn retention(&self) -> usize {
        self.retention
    }

    /// Total events appended over the log's lifetime.
    #[must_use]
    pub fn appended(&self) -> u64 {
        self.read().appended
    }

    /// Current `{seq, len}` pair, read atomically.
    #[must_use]
    pub fn status(&self) -> EvqStatus {
        let ring = self.read();
        EvqStatus {
            seq: ring.current,
            len: ring.events.len(),
        }
    }

    /// The `n` most recently appended events, oldest first.
    ///
    /// Callers must keep `n <= len()`; larger values are clamped.
    #[must_use]
    pub fn slice(&self, n: usize) -> Vec<Event> {
        let ring = self.read();
        debug_assert!(n <= ring.events.len(), "slice({n}) past retained window");
        Self::last_n(&ring, n)
    }

    /// A consistent read view of the log.
    ///
    /// Appends block while the view is alive, so keep it short and never hold
    /// it across an `.await`.
    #[must_use]
    pub fn view(&self) -> LogView<'_> {
        LogView { ring: self.read() }
    }

    fn last_n(ring: &Ring, n: usize) -> Vec<Event> {
        let n = n.min(ring.events.len());
        let start = ring.events.len() - n;
        ring.events.range(start..).cloned().collect()
    }
}

/// Read guard over the log: status and slices taken through one view always
/// agree with each other.
#[derive(Debug)]
pub struct LogView<'a> {
    ring: RwLockReadGuard<'a, Ring>,
}

impl LogView<'_> {
    /// The `{seq, len}` pair.
    #[must_use]
    pub fn status(&self) -> EvqStatus {
        EvqStatus {
            seq: self.ring.current,
            len: self.ring.events.len(),
        }
    }

    /// Up to `n` newest events, oldest first. `n` is clamped to the window.
    #[must_use]
    pub fn slice(&self, n: usize) -> Vec<Event> {
        EventLog::last_n(&self.ring, n)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RETENTION, SequenceNumber::INITIAL)
    }
}
