//! # statfan - live status fan-out
//!
//! statfan keeps a short, sequence-numbered log of recent status events and
//! lets many browser clients follow it with long-polling. Each reader sends
//! the last sequence number it has seen and gets back exactly one of:
//!
//! - the events it is missing, oldest first;
//! - `reload`, when it has fallen out of the retained window and must fetch
//!   a full snapshot;
//! - an empty diff after the poll timeout, when nothing happened.
//!
//! ## Core Concepts
//!
//! - **Feed**: the event log plus the registry of parked readers
//! - **SequenceNumber**: monotonically increasing event id; `-1` means "knows nothing"
//! - **StatusBoard**: authoritative full state served on reload
//! - **IngestAdapter**: turns upstream poller messages into feed events
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use statfan::{Feed, SequenceNumber, UpdateResponse};
//!
//! let feed = Arc::new(Feed::default());
//! feed.publish(serde_json::json!({"id": "T2A", "ok": true}));
//!
//! match feed.get_update(Some(SequenceNumber::INITIAL)).await {
//!     UpdateResponse::Ok { ev, .. } => assert_eq!(ev.len(), 1),
//!     other => panic!("{other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod service;
pub mod snapshot;

#[cfg(feature = "transport-http")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use config::{FeedConfig, IngestConfig, LogConfig, LogFormat, ServerConfig, StatfanConfig};
pub use error::{
    ConfigError, IngestError, SnapshotError, StatfanError, StatfanResult, ValidationError,
};
pub use feed::{
    Event, EventLog, EvqStatus, Feed, FeedStats, SequenceNumber, UpdateResponse, Wake,
    WaitOutcome, WaiterRegistry,
};
pub use ingest::{pump_lines, IngestAdapter, IngestOutcome, IngestStats, IngestWorker};
pub use service::{FullResponse, LogResponse, ServiceStats, StatusService};
pub use snapshot::{EntityLog, Snapshot, SnapshotProvider, StatusBoard};
