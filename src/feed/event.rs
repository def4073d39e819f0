//! Core value types of the event feed.
//!
//! Events are opaque JSON payloads; the feed never looks inside them. They are
//! shared behind an `Arc` so that handing the same tail to many readers costs a
//! refcount bump per event instead of a deep clone.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

/// Position of an event in the process-lifetime total order.
///
/// Incremented exactly once per appended event, never reused, never
/// decremented. Signed so that the conventional "nothing yet" sentinel of -1
/// is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Default initial value: the sequence number "before" the first event.
    pub const INITIAL: Self = Self(-1);

    /// Wrap a raw sequence value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Number of events between `earlier` and `self`, saturating at zero.
    #[must_use]
    pub fn distance_from(self, earlier: Self) -> u64 {
        u64::try_from(self.0.saturating_sub(earlier.0)).unwrap_or(0)
    }
}

impl Default for SequenceNumber {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for SequenceNumber {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// An appended event: an immutable payload bound to its sequence number.
///
/// Serializes as the bare payload, which is what readers receive in `ev`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    seq: SequenceNumber,
    payload: Arc<serde_json::Value>,
}

impl Event {
    pub(crate) fn new(seq: SequenceNumber, payload: serde_json::Value) -> Self {
        Self {
            seq,
            payload: Arc::new(payload),
        }
    }

    /// Sequence number assigned at append time.
    #[must_use]
    pub const fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// The opaque payload.
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.payload.serialize(serializer)
    }
}

/// The `evq` pair reported alongside every response.
///
/// `seq` is the sequence number of the newest retained event and `len` the
/// number of retained events. Clients splice snapshots and diffs on this pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvqStatus {
    /// Newest sequence number.
    pub seq: SequenceNumber,
    /// Retained event count.
    pub len: usize,
}

/// Why a pending waiter was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The log advanced; carries the sequence number current at wake time.
    Advanced(SequenceNumber),
    /// Upstream asked every reader to drop its diff state and reload.
    Reload,
}
