//! Upstream ingest.
//!
//! The upstream poller publishes one JSON object per status change. The
//! `"event"` field selects how a message is handled:
//!
//! - the reload kind (default `"reload"`) wakes every parked reader with a
//!   reload directive and is not appended;
//! - the log kind (default `"log"`) stores `{"id", "log"}` as the entity's
//!   latest poll log and is not broadcast;
//! - anything else is a status event: the entity's latest status is recorded
//!   on the board (when it carries a string `"id"`), then it is appended to
//!   the feed.
//!
//! Undecodable messages are logged, counted and dropped; they never reach the
//! log or the sequence counter. That includes lines that are not UTF-8 and
//! lines longer than `ingest.max_line_bytes`.
//!
//! [`IngestWorker`] decouples producers from the feed with a bounded queue
//! drained by a dedicated thread. `submit` never blocks: when the queue is
//! full the message is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::IngestConfig;
use crate::error::{IngestError, StatfanError, StatfanResult};
use crate::feed::{Feed, SequenceNumber};
use crate::snapshot::StatusBoard;

/// What an accepted upstream message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended to the feed.
    #[allow(missing_docs)]
    Appended { seq: SequenceNumber },
    /// Broadcast a reload to this many parked readers.
    #[allow(missing_docs)]
    Reload { woken: usize },
    /// Stored as the latest poll log of `id`.
    #[allow(missing_docs)]
    Logged { id: String },
}

/// Ingest counters.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub appended: u64,
    pub reloads: u64,
    pub logs: u64,
    pub malformed: u64,
    pub dropped: u64,
}

/// Decodes upstream messages and applies them to the feed and board.
#[derive(Debug)]
pub struct IngestAdapter {
    feed: Arc<Feed>,
    board: Option<Arc<StatusBoard>>,
    cfg: IngestConfig,
    appended: AtomicU64,
    reloads: AtomicU64,
    logs: AtomicU64,
    malformed: AtomicU64,
}

impl IngestAdapter {
    /// Adapter that only feeds `feed`.
    #[must_use]
    pub fn new(feed: Arc<Feed>, cfg: IngestConfig) -> Self {
        Self {
            feed,
            board: None,
            cfg,
            appended: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            logs: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Also record statuses and logs on `board`.
    #[must_use]
    pub fn with_board(mut self, board: Arc<StatusBoard>) -> Self {
        self.board = Some(board);
        self
    }

    /// Handle one raw upstream message.
    pub fn on_upstream_event(&self, raw: &str) -> Result<IngestOutcome, IngestError> {
        let result = self.apply(raw);
        match &result {
            Ok(IngestOutcome::Appended { .. }) => {
                self.appended.fetch_add(1, Ordering::Relaxed);
            }
            Ok(IngestOutcome::Reload { .. }) => {
                self.reloads.fetch_add(1, Ordering::Relaxed);
            }
            Ok(IngestOutcome::Logged { .. }) => {
                self.logs.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.reject(e, raw.len()),
        }
        result
    }

    /// Count and log a message that never made it to decoding.
    pub fn reject(&self, err: &IngestError, bytes: usize) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(error = %err, bytes, "dropping upstream message");
    }

    /// Longest upstream line accepted, newline excluded.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.cfg.max_line_bytes
    }

    fn apply(&self, raw: &str) -> Result<IngestOutcome, IngestError> {
        let msg: Value = serde_json::from_str(raw).map_err(|e| IngestError::Malformed {
            reason: e.to_string(),
        })?;
        let Some(obj) = msg.as_object() else {
            return Err(IngestError::NotAnObject);
        };

        let kind = obj.get("event").and_then(Value::as_str);
        if kind == Some(self.cfg.reload_event.as_str()) {
            return Ok(IngestOutcome::Reload {
                woken: self.feed.broadcast_reload(),
            });
        }

        let id = obj.get("id").and_then(Value::as_str);

        if kind == Some(self.cfg.log_event.as_str()) {
            let (Some(id), Some(log)) = (id, obj.get("log").and_then(Value::as_str)) else {
                return Err(IngestError::Malformed {
                    reason: "log message needs string \"id\" and \"log\"".to_string(),
                });
            };
            if let Some(board) = &self.board {
                board.store_log(id, log);
            }
            tracing::debug!(id, "stored poll log");
            return Ok(IngestOutcome::Logged { id: id.to_string() });
        }

        // Board first: a reader that sees seq N and then reloads must find
        // event N reflected in the snapshot.
        if let (Some(board), Some(id)) = (&self.board, id) {
            board.record_status(id, msg.clone());
        }
        Ok(IngestOutcome::Appended {
            seq: self.feed.publish(msg),
        })
    }

    /// Counters so far; `dropped` is always 0 here.
    #[must_use]
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            appended: self.appended.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            logs: self.logs.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: 0,
        }
    }
}

enum IngestMsg {
    Raw(String),
    Shutdown,
}

/// Bounded queue + dedicated thread in front of an [`IngestAdapter`].
#[derive(Debug)]
pub struct IngestWorker {
    adapter: Arc<IngestAdapter>,
    tx: Sender<IngestMsg>,
    capacity: usize,
    dropped: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IngestMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(raw) => f.debug_tuple("Raw").field(&raw.len()).finish(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl IngestWorker {
    /// Start the worker thread.
    pub fn spawn(adapter: Arc<IngestAdapter>, queue_capacity: usize) -> StatfanResult<Self> {
        let capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<IngestMsg>(capacity);

        let thread_adapter = Arc::clone(&adapter);
        let join = thread::Builder::new()
            .name("statfan-ingest".to_string())
            .spawn(move || worker_loop(&thread_adapter, &rx))
            .map_err(|e| StatfanError::internal(format!("failed to spawn ingest thread: {e}")))?;

        Ok(Self {
            adapter,
            tx,
            capacity,
            dropped: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        })
    }

    /// Non-blocking enqueue of one raw upstream message.
    pub fn submit(&self, raw: impl Into<String>) -> StatfanResult<()> {
        let err = match self.tx.try_send(IngestMsg::Raw(raw.into())) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => IngestError::QueueFull {
                capacity: self.capacity,
            },
            Err(TrySendError::Disconnected(_)) => IngestError::Disconnected,
        };
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Err(err.into())
    }

    /// The adapter the thread applies messages with.
    #[must_use]
    pub fn adapter(&self) -> &Arc<IngestAdapter> {
        &self.adapter
    }

    /// Messages refused by `submit`.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Adapter counters plus `dropped`.
    #[must_use]
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            dropped: self.dropped(),
            ..self.adapter.stats()
        }
    }

    /// Drain what is already queued, then stop the thread and wait for it.
    ///
    /// Idempotent; later `submit`s fail with `Disconnected`.
    pub fn shutdown(&self) {
        let handle = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = self.tx.send(IngestMsg::Shutdown);
            if handle.join().is_err() {
                tracing::error!("ingest worker panicked");
            }
        }
    }
}

fn worker_loop(adapter: &IngestAdapter, rx: &Receiver<IngestMsg>) {
    tracing::debug!("ingest worker started");
    while let Ok(msg) = rx.recv() {
        match msg {
            // Failures are logged and counted by the adapter.
            IngestMsg::Raw(raw) => {
                let _ = adapter.on_upstream_event(&raw);
            }
            IngestMsg::Shutdown => break,
        }
    }
    tracing::debug!("ingest worker stopped");
}

/// Feed newline-delimited JSON from `reader` into `worker` until EOF.
///
/// Blank lines are skipped. Lines that are not UTF-8 or exceed the adapter's
/// `max_line_bytes` are counted as malformed and skipped; the stream goes on
/// with the next line. Returns the number of messages queued. Only a read
/// error ends the stream early.
pub async fn pump_lines<R>(mut reader: R, worker: &IngestWorker) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let adapter = worker.adapter();
    let limit = adapter.max_line_bytes();
    // Room for the line plus its newline; one byte more means too long.
    let window = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);

    let mut buf = Vec::new();
    let mut accepted = 0u64;
    loop {
        buf.clear();
        let n = (&mut reader).take(window).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') && buf.len() > limit {
            let skipped = buf.len() + discard_line(&mut reader).await?;
            adapter.reject(&IngestError::LineTooLong { limit }, skipped);
            continue;
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                let err = IngestError::Malformed {
                    reason: format!("invalid UTF-8: {e}"),
                };
                adapter.reject(&err, buf.len());
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        match worker.submit(line) {
            Ok(()) => accepted += 1,
            Err(e) => tracing::warn!(error = %e, "upstream message not queued"),
        }
    }
    Ok(accepted)
}

/// Consume through the next newline (or EOF); returns the bytes consumed.
async fn discard_line<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            reader.consume(pos + 1);
            return Ok(consumed + pos + 1);
        }
        let len = available.len();
        reader.consume(len);
        consumed += len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::FeedConfig;
    use crate::snapshot::SnapshotProvider;

    fn setup() -> (Arc<Feed>, Arc<StatusBoard>, IngestAdapter) {
        let feed = Arc::new(Feed::new(&FeedConfig {
            retention: 3,
            ..FeedConfig::default()
        }));
        let board = Arc::new(StatusBoard::new());
        let adapter =
            IngestAdapter::new(Arc::clone(&feed), IngestConfig::default()).with_board(Arc::clone(&board));
        (feed, board, adapter)
    }

    #[test]
    fn status_event_is_recorded_and_appended() {
        let (feed, board, adapter) = setup();
        let out = adapter
            .on_upstream_event(r#"{"event":"poll","id":"T2A","ok":true}"#)
            .unwrap();
        assert_eq!(out, IngestOutcome::Appended { seq: SequenceNumber::new(0) });
        assert_eq!(feed.status().len, 1);

        let snap = board.snapshot().unwrap();
        assert_eq!(snap.servers[0]["status"], json!({"event": "poll", "id": "T2A", "ok": true}));
    }

    #[test]
    fn event_without_id_is_still_appended() {
        let (feed, board, adapter) = setup();
        adapter.on_upstream_event(r#"{"event":"sqlend","duration":3}"#).unwrap();
        assert_eq!(feed.status().seq, SequenceNumber::new(0));
        assert_eq!(board.server_count(), 0);
    }

    #[test]
    fn reload_message_does_not_append() {
        let (feed, _board, adapter) = setup();
        let id = feed.waiters().register_fn(|_| {});
        let out = adapter.on_upstream_event(r#"{"event":"reload"}"#).unwrap();
        assert_eq!(out, IngestOutcome::Reload { woken: 1 });
        assert_eq!(feed.status().seq, SequenceNumber::INITIAL);
        assert!(!feed.waiters().cancel(id));
    }

    #[test]
    fn log_message_goes_to_board_only() {
        let (feed, board, adapter) = setup();
        let out = adapter
            .on_upstream_event(r#"{"event":"log","id":"T2A","log":"polling T2A\n"}"#)
            .unwrap();
        assert_eq!(out, IngestOutcome::Logged { id: "T2A".to_string() });
        assert_eq!(feed.status().len, 0);
        assert_eq!(board.entity_log("T2A").unwrap().unwrap().log, "polling T2A\n");
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let (feed, _board, adapter) = setup();
        adapter.on_upstream_event(r#"{"id":"T2A"}"#).unwrap();

        assert!(matches!(
            adapter.on_upstream_event("{not json"),
            Err(IngestError::Malformed { .. })
        ));
        assert!(matches!(adapter.on_upstream_event("[1,2]"), Err(IngestError::NotAnObject)));
        assert!(matches!(
            adapter.on_upstream_event(r#"{"event":"log","id":"T2A"}"#),
            Err(IngestError::Malformed { .. })
        ));

        assert_eq!(feed.status().seq, SequenceNumber::new(0));
        let stats = adapter.stats();
        assert_eq!(stats.malformed, 3);
        assert_eq!(stats.appended, 1);
    }

    #[test]
    fn custom_reload_kind() {
        let feed = Arc::new(Feed::default());
        let adapter = IngestAdapter::new(
            Arc::clone(&feed),
            IngestConfig {
                reload_event: "flush".to_string(),
                ..IngestConfig::default()
            },
        );
        assert!(matches!(
            adapter.on_upstream_event(r#"{"event":"flush"}"#),
            Ok(IngestOutcome::Reload { .. })
        ));
        assert!(matches!(
            adapter.on_upstream_event(r#"{"event":"reload"}"#),
            Ok(IngestOutcome::Appended { .. })
        ));
    }

    #[test]
    fn worker_drains_queue_before_shutdown() {
        let (feed, _board, adapter) = setup();
        let worker = IngestWorker::spawn(Arc::new(adapter), 64).unwrap();
        for i in 0..10 {
            worker.submit(json!({"n": i}).to_string()).unwrap();
        }
        worker.shutdown();

        assert_eq!(feed.status().seq, SequenceNumber::new(9));
        assert_eq!(worker.stats().appended, 10);
        assert!(matches!(
            worker.submit("{}"),
            Err(StatfanError::Ingest(IngestError::Disconnected))
        ));
        assert_eq!(worker.dropped(), 1);
        worker.shutdown();
    }

    #[tokio::test]
    async fn pump_skips_blank_lines() {
        let (feed, _board, adapter) = setup();
        let worker = IngestWorker::spawn(Arc::new(adapter), 64).unwrap();

        let input: &[u8] = b"{\"id\":\"A\"}\n\n   \n{\"id\":\"B\"}\nnot json\n";
        let accepted = pump_lines(input, &worker).await.unwrap();
        worker.shutdown();

        assert_eq!(accepted, 3);
        assert_eq!(feed.status().len, 2);
        assert_eq!(worker.stats().malformed, 1);
    }

    #[tokio::test]
    async fn pump_survives_invalid_utf8() {
        let (feed, _board, adapter) = setup();
        let worker = IngestWorker::spawn(Arc::new(adapter), 64).unwrap();

        let input: &[u8] = b"{\"id\":\"A\"}\n{\"id\":\"\xff\xfe\"}\n{\"id\":\"B\"}\n{\"id\":\"C\"}\n";
        let accepted = pump_lines(input, &worker).await.unwrap();
        worker.shutdown();

        assert_eq!(accepted, 3);
        let stats = worker.stats();
        assert_eq!((stats.appended, stats.malformed), (3, 1));
        assert_eq!(feed.status().seq, SequenceNumber::new(2));
    }

    #[tokio::test]
    async fn pump_skips_oversized_line_and_resumes() {
        let feed = Arc::new(Feed::default());
        let adapter = IngestAdapter::new(
            Arc::clone(&feed),
            IngestConfig {
                max_line_bytes: 16,
                ..IngestConfig::default()
            },
        );
        let worker = IngestWorker::spawn(Arc::new(adapter), 64).unwrap();

        let long = format!("{{\"id\":\"{}\"}}", "x".repeat(100));
        // Exactly at the limit is still accepted.
        let at_limit = r#"{"id":"ABCDEFG"}"#;
        assert_eq!(at_limit.len(), 16);
        let input = format!("{{\"id\":\"A\"}}\n{long}\n{at_limit}\n{long}");
        let accepted = pump_lines(input.as_bytes(), &worker).await.unwrap();
        worker.shutdown();

        assert_eq!(accepted, 2);
        let stats = worker.stats();
        assert_eq!((stats.appended, stats.malformed), (2, 2));
        let ids: Vec<_> = feed.log().slice(2).iter().map(|e| e.payload()["id"].clone()).collect();
        assert_eq!(ids, vec![json!("A"), json!("ABCDEFG")]);
    }
}
