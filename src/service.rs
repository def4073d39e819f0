//! Transport-agnostic request surface.
//!
//! [`StatusService`] is what a transport binds to: it parses raw request
//! parameters, runs the catch-up protocol on the [`Feed`], and composes the
//! snapshot and log responses from a [`SnapshotProvider`]. Nothing here knows
//! about HTTP.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{StatfanResult, ValidationError};
use crate::feed::{EvqStatus, Feed, FeedStats, SequenceNumber, UpdateResponse};
use crate::ingest::{IngestStats, IngestWorker};
use crate::snapshot::SnapshotProvider;

/// `{"result":"full", ...}`: the authoritative state plus the cursor to
/// resume diffing from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename = "full")]
#[allow(missing_docs)]
pub struct FullResponse {
    pub cfg: Value,
    pub evq: EvqStatus,
    pub servers: Vec<Value>,
    pub rotates: Vec<Value>,
}

/// Response of an entity log request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum LogResponse {
    /// The entity's log and when it was stored.
    #[allow(missing_docs)]
    Ok { t: DateTime<Utc>, log: String },
    /// No id given, or nothing stored for it.
    Fail,
}

/// Counters served on `/api/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    /// Feed counters, flattened into the top level.
    #[serde(flatten)]
    pub feed: FeedStats,
    /// Present when an ingest worker is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<IngestStats>,
}

/// Parse the `seq` request parameter.
///
/// Surrounding whitespace is ignored; `0` and negative values are valid.
pub fn parse_cursor(raw: Option<&str>) -> Result<SequenceNumber, ValidationError> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    let Some(raw) = raw else {
        return Err(ValidationError::MissingCursor);
    };
    raw.parse::<i64>()
        .map(SequenceNumber::new)
        .map_err(|_| ValidationError::InvalidCursor {
            raw: raw.chars().take(32).collect(),
        })
}

/// Feed + snapshot source behind the public endpoints.
pub struct StatusService {
    feed: Arc<Feed>,
    snapshots: Arc<dyn SnapshotProvider>,
    ingest: Option<Arc<IngestWorker>>,
}

impl std::fmt::Debug for StatusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusService")
            .field("feed", &self.feed)
            .field("ingest", &self.ingest.is_some())
            .finish_non_exhaustive()
    }
}

impl StatusService {
    /// Service over `feed`, answering snapshots from `snapshots`.
    #[must_use]
    pub fn new(feed: Arc<Feed>, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            feed,
            snapshots,
            ingest: None,
        }
    }

    /// Report this worker's counters in [`StatusService::stats`].
    #[must_use]
    pub fn with_ingest(mut self, worker: Arc<IngestWorker>) -> Self {
        self.ingest = Some(worker);
        self
    }

    /// The underlying feed.
    #[must_use]
    pub const fn feed(&self) -> &Arc<Feed> {
        &self.feed
    }

    /// Long-poll update. A missing or malformed cursor answers `fail`
    /// immediately and leaves all state alone.
    pub async fn get_update(&self, raw_cursor: Option<&str>) -> UpdateResponse {
        match parse_cursor(raw_cursor) {
            Ok(cursor) => self.feed.get_update(Some(cursor)).await,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting update request");
                UpdateResponse::Fail
            }
        }
    }

    /// Full snapshot with the `{seq, len}` to resume from.
    ///
    /// The cursor is read before the snapshot: events that land in between
    /// are in the snapshot and will be delivered again as a diff, which
    /// readers apply idempotently. The reverse order could lose them.
    pub fn full_snapshot(&self) -> StatfanResult<FullResponse> {
        let evq = self.feed.status();
        let snap = self.snapshots.snapshot()?;
        tracing::debug!(seq = %evq.seq, len = evq.len, servers = snap.servers.len(), "full snapshot");
        Ok(FullResponse {
            cfg: snap.cfg,
            evq,
            servers: snap.servers,
            rotates: snap.rotates,
        })
    }

    /// Latest poll log of one entity.
    pub fn entity_log(&self, id: Option<&str>) -> StatfanResult<LogResponse> {
        let Some(id) = id.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(LogResponse::Fail);
        };
        Ok(match self.snapshots.entity_log(id)? {
            Some(entry) => LogResponse::Ok {
                t: entry.t,
                log: entry.log,
            },
            None => LogResponse::Fail,
        })
    }

    /// Feed counters plus the ingest worker's, if attached.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            feed: self.feed.stats(),
            ingest: self.ingest.as_ref().map(|w| w.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::FeedConfig;
    use crate::error::{SnapshotError, StatfanError};
    use crate::snapshot::{EntityLog, Snapshot, StatusBoard};

    fn service() -> (Arc<Feed>, Arc<StatusBoard>, StatusService) {
        let feed = Arc::new(Feed::new(&FeedConfig {
            retention: 3,
            ..FeedConfig::default()
        }));
        let board = Arc::new(StatusBoard::new());
        let svc = StatusService::new(Arc::clone(&feed), Arc::clone(&board) as Arc<dyn SnapshotProvider>);
        (feed, board, svc)
    }

    struct Down;

    impl SnapshotProvider for Down {
        fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
            Err(SnapshotError::Unavailable {
                message: "store offline".to_string(),
            })
        }

        fn entity_log(&self, _id: &str) -> Result<Option<EntityLog>, SnapshotError> {
            Err(SnapshotError::Unavailable {
                message: "store offline".to_string(),
            })
        }
    }

    #[test]
    fn cursor_parsing() {
        assert_eq!(parse_cursor(Some("0")).unwrap(), SequenceNumber::new(0));
        assert_eq!(parse_cursor(Some(" -1 ")).unwrap(), SequenceNumber::INITIAL);
        assert!(matches!(parse_cursor(None), Err(ValidationError::MissingCursor)));
        assert!(matches!(parse_cursor(Some("  ")), Err(ValidationError::MissingCursor)));
        assert!(matches!(
            parse_cursor(Some("12abc")),
            Err(ValidationError::InvalidCursor { ref raw }) if raw == "12abc"
        ));
    }

    #[tokio::test]
    async fn bad_cursor_fails_without_registering() {
        let (feed, _board, svc) = service();
        assert_eq!(svc.get_update(None).await, UpdateResponse::Fail);
        assert_eq!(svc.get_update(Some("x")).await, UpdateResponse::Fail);
        assert_eq!(feed.waiters().counters().registered, 0);
    }

    #[tokio::test]
    async fn zero_cursor_is_valid() {
        let (feed, _board, svc) = service();
        feed.publish(json!("A"));
        feed.publish(json!("B"));

        let resp = svc.get_update(Some("0")).await;
        assert!(resp.is_ok());
        assert_eq!(resp.events().len(), 1);
    }

    #[test]
    fn full_snapshot_embeds_cursor() {
        let (feed, board, svc) = service();
        board.set_web_config(json!({"title": "aprs2"}));
        board.record_status("T2A", json!({"id": "T2A"}));
        feed.publish(json!({"id": "T2A"}));

        let full = svc.full_snapshot().unwrap();
        assert_eq!(full.evq, feed.status());
        assert_eq!(full.servers.len(), 1);

        let v = serde_json::to_value(&full).unwrap();
        assert_eq!(v["result"], "full");
        assert_eq!(v["evq"], json!({"seq": 0, "len": 1}));
        assert_eq!(v["cfg"]["title"], "aprs2");
    }

    #[test]
    fn snapshot_failure_propagates() {
        let svc = StatusService::new(Arc::new(Feed::default()), Arc::new(Down));
        let err = svc.full_snapshot().unwrap_err();
        assert!(matches!(err, StatfanError::Snapshot(SnapshotError::Unavailable { .. })));
        assert!(err.is_retryable());
        assert!(svc.entity_log(Some("T2A")).is_err());
        // Nothing to look up, so the provider is never asked.
        assert_eq!(svc.entity_log(None).unwrap(), LogResponse::Fail);
    }

    #[test]
    fn entity_log_responses() {
        let (_feed, board, svc) = service();
        board.store_log("T2A", "ok\n");

        match svc.entity_log(Some("T2A")).unwrap() {
            LogResponse::Ok { log, .. } => assert_eq!(log, "ok\n"),
            LogResponse::Fail => panic!("expected a log"),
        }
        assert_eq!(svc.entity_log(Some("T2Z")).unwrap(), LogResponse::Fail);
        assert_eq!(svc.entity_log(Some("")).unwrap(), LogResponse::Fail);
        assert_eq!(
            serde_json::to_value(LogResponse::Fail).unwrap(),
            json!({"result": "fail"})
        );
    }

    #[test]
    fn stats_flatten_feed_counters() {
        let (feed, _board, svc) = service();
        feed.publish(json!(1));
        let v = serde_json::to_value(svc.stats()).unwrap();
        assert_eq!(v["evq"], json!({"seq": 0, "len": 1}));
        assert_eq!(v["appended"], 1);
        assert!(v.get("ingest").is_none());
    }
}
