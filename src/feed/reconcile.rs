//! Catch-up protocol.
//!
//! Given a reader's cursor (the last sequence number it has seen) the feed
//! answers with one of three things:
//!
//! - `ok` with the events the reader is missing, oldest first;
//! - `reload` when the gap is wider than the retained window, so the reader
//!   must fetch a full snapshot and restart from the `evq` it carries;
//! - nothing yet, when the reader is current: the request is parked until
//!   the next append, a reload broadcast, or the poll timeout. A timeout
//!   answers `ok` with an empty `ev` and the unchanged `evq`.
//!
//! A cursor ahead of the log (for example from before a restart) is treated
//! as the sentinel, i.e. "knows nothing". A reload broadcast after the
//! request started, or a closed feed, answers `reload` instead of parking.

use serde::Serialize;
use tokio::time::Instant;

use super::event::{Event, EvqStatus, SequenceNumber, Wake};
use super::log::LogView;
use super::waiters::WaitOutcome;
use super::Feed;

/// Wire response of an update request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum UpdateResponse {
    /// Diff (possibly empty) against the reader's cursor.
    #[allow(missing_docs)]
    Ok { evq: EvqStatus, ev: Vec<Event> },
    /// Malformed request.
    Fail,
    /// The reader must fetch a full snapshot.
    #[allow(missing_docs)]
    Reload { evq: EvqStatus },
}

impl UpdateResponse {
    /// True for an `ok` diff, empty or not.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// True for a `reload` directive.
    #[must_use]
    pub const fn is_reload(&self) -> bool {
        matches!(self, Self::Reload { .. })
    }

    /// The `{seq, len}` pair, absent on `fail`.
    #[must_use]
    pub const fn evq(&self) -> Option<EvqStatus> {
        match self {
            Self::Ok { evq, .. } | Self::Reload { evq } => Some(*evq),
            Self::Fail => None,
        }
    }

    /// Events carried by an `ok` response.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        match self {
            Self::Ok { ev, .. } => ev,
            _ => &[],
        }
    }
}

/// What to do with a reader at a given cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send the `behind` newest events.
    #[allow(missing_docs)]
    Diff { behind: usize },
    /// The gap exceeds retained history.
    Reload,
    /// The reader is current; park it.
    Wait,
}

/// Classify a (normalized) cursor against the log status.
///
/// A reader exactly `len` events behind still gets a diff: the oldest
/// retained event is the first one it is missing.
#[must_use]
pub fn decide(cursor: SequenceNumber, status: EvqStatus) -> Decision {
    let behind = status.seq.distance_from(cursor);
    match usize::try_from(behind) {
        Ok(0) => Decision::Wait,
        Ok(behind) if behind <= status.len => Decision::Diff { behind },
        _ => Decision::Reload,
    }
}

/// Map a cursor ahead of the log to the sentinel.
#[must_use]
pub fn normalize(cursor: SequenceNumber, current: SequenceNumber, sentinel: SequenceNumber) -> SequenceNumber {
    if cursor > current {
        sentinel
    } else {
        cursor
    }
}

/// What the check made right after registering a waiter found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recheck {
    /// Nothing changed since the decision; park.
    Park,
    /// The log advanced; decide again.
    Retry,
    /// A reload was broadcast (or the feed closed); answer `reload`.
    Reload,
}

fn respond(view: &LogView<'_>, decision: Decision) -> UpdateResponse {
    let evq = view.status();
    match decision {
        // Re-clamped even though `decide` already bounds it.
        Decision::Diff { behind } => UpdateResponse::Ok {
            evq,
            ev: view.slice(behind.min(evq.len)),
        },
        Decision::Reload => UpdateResponse::Reload { evq },
        Decision::Wait => UpdateResponse::Ok { evq, ev: Vec::new() },
    }
}

impl Feed {
    // A wake cycle that ran between the decision and the registration never
    // saw the new waiter, so its effect has to be detected here.
    fn recheck(&self, seen: SequenceNumber, generation: u64) -> Recheck {
        if self.is_closed() || self.reload_generation() != generation {
            Recheck::Reload
        } else if self.log().current_sequence() != seen {
            Recheck::Retry
        } else {
            Recheck::Park
        }
    }

    /// Answer an update request, parking the caller while it is current.
    ///
    /// `None` means the request carried no cursor and is answered `fail`
    /// without touching the log. Dropping the returned future (client
    /// disconnect) cancels the parked waiter.
    pub async fn get_update(&self, cursor: Option<SequenceNumber>) -> UpdateResponse {
        let Some(cursor) = cursor else {
            tracing::debug!("no sequence number given");
            return UpdateResponse::Fail;
        };

        let deadline = Instant::now() + self.poll_timeout();
        let generation = self.reload_generation();
        let cursor = normalize(cursor, self.log().current_sequence(), self.sentinel());

        loop {
            let seen = {
                let view = self.log().view();
                let status = view.status();
                match decide(cursor, status) {
                    Decision::Wait => status.seq,
                    decision => {
                        tracing::debug!(%cursor, seq = %status.seq, len = status.len, ?decision, "update");
                        return respond(&view, decision);
                    }
                }
            };

            // Register before re-checking, so an append or reload landing
            // between the check above and the registration is not lost.
            let waiter = self.waiters().register();
            match self.recheck(seen, generation) {
                Recheck::Park => {}
                Recheck::Retry => {
                    drop(waiter);
                    continue;
                }
                Recheck::Reload => {
                    drop(waiter);
                    tracing::debug!(%cursor, "reload before parking");
                    return UpdateResponse::Reload { evq: self.status() };
                }
            }

            tracing::trace!(%cursor, waiter = %waiter.id(), "parked");
            match waiter.wait_until(deadline).await {
                WaitOutcome::Woken(Wake::Reload) => {
                    tracing::debug!(%cursor, "reload while parked");
                    return UpdateResponse::Reload { evq: self.status() };
                }
                WaitOutcome::Woken(Wake::Advanced(_)) => {}
                WaitOutcome::TimedOut | WaitOutcome::Canceled => {
                    let view = self.log().view();
                    let decision = decide(cursor, view.status());
                    tracing::debug!(%cursor, ?decision, "long-poll expired");
                    return respond(&view, decision);
                }
            }
        }
    }
}
