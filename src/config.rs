//! Configuration.
//!
//! Every field has a default, so an empty (or absent) TOML file yields a
//! working setup:
//!
//! ```toml
//! [feed]
//! retention = 30
//! initial_sequence = -1
//! poll_timeout_secs = 30
//!
//! [ingest]
//! queue_capacity = 4096
//! max_line_bytes = 65536
//!
//! [server]
//! listen = "127.0.0.1:8036"
//! upstream_listen = "127.0.0.1:8037"
//! seed_path = "/var/lib/statfan/seed.json"
//!
//! [log]
//! format = "json"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::feed::SequenceNumber;

/// Events retained for diffing when nothing else is configured.
pub const DEFAULT_RETENTION: usize = 30;

/// Long-poll timeout, kept below common proxy idle timeouts.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted upstream line, newline excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Event log and long-poll settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    /// Number of recent events kept for diffing (K).
    pub retention: usize,
    /// Counter value before the first event; also the "unknown cursor" sentinel.
    pub initial_sequence: i64,
    /// How long an up-to-date reader is parked before an empty answer.
    pub poll_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            initial_sequence: SequenceNumber::INITIAL.get(),
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT.as_secs(),
        }
    }
}

impl FeedConfig {
    /// `initial_sequence` as a [`SequenceNumber`].
    #[must_use]
    pub const fn initial(&self) -> SequenceNumber {
        SequenceNumber::new(self.initial_sequence)
    }

    /// `poll_timeout_secs` as a [`Duration`].
    #[must_use]
    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Upstream ingest settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Max queued upstream messages before new ones are dropped.
    pub queue_capacity: usize,
    /// `"event"` value of the message that forces every reader to reload.
    pub reload_event: String,
    /// `"event"` value of per-entity poll log messages.
    pub log_event: String,
    /// Upstream lines longer than this are skipped and counted as malformed.
    pub max_line_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            reload_event: "reload".to_string(),
            log_event: "log".to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Listener settings for the server binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub listen: SocketAddr,
    /// Line-delimited JSON upstream listen address.
    pub upstream_listen: SocketAddr,
    /// Optional JSON file seeding web config, servers and rotates.
    pub seed_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8036)),
            upstream_listen: SocketAddr::from(([127, 0, 0, 1], 8037)),
            seed_path: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Log output settings for the server binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "statfan=info".to_string(),
        }
    }
}

/// Top-level configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatfanConfig {
    pub feed: FeedConfig,
    pub ingest: IngestConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

impl StatfanConfig {
    /// Parse a TOML document. `origin` is only used in error messages.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Reject values the feed cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.retention == 0 {
            return Err(invalid("feed.retention", "must be at least 1"));
        }
        if self.feed.poll_timeout_secs == 0 {
            return Err(invalid("feed.poll_timeout_secs", "must be greater than zero"));
        }
        if self.ingest.queue_capacity == 0 {
            return Err(invalid("ingest.queue_capacity", "must be at least 1"));
        }
        if self.ingest.max_line_bytes == 0 {
            return Err(invalid("ingest.max_line_bytes", "must be at least 1"));
        }
        if self.ingest.reload_event.trim().is_empty() {
            return Err(invalid("ingest.reload_event", "must not be empty"));
        }
        if self.ingest.reload_event == self.ingest.log_event {
            return Err(invalid("ingest.log_event", "must differ from ingest.reload_event"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = StatfanConfig::from_toml_str("", Path::new("inline")).unwrap();
        assert_eq!(cfg, StatfanConfig::default());
        assert_eq!(cfg.feed.retention, 30);
        assert_eq!(cfg.feed.initial(), SequenceNumber::INITIAL);
        assert_eq!(cfg.feed.poll_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.server.listen.port(), 8036);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = StatfanConfig::from_toml_str(
            "[feed]\nretention = 3\n\n[log]\nformat = \"json\"\n",
            Path::new("inline"),
        )
        .unwrap();
        assert_eq!(cfg.feed.retention, 3);
        assert_eq!(cfg.feed.poll_timeout_secs, 30);
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.ingest, IngestConfig::default());
    }

    #[test]
    fn zero_retention_is_rejected() {
        let err = StatfanConfig::from_toml_str("[feed]\nretention = 0\n", Path::new("inline"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "feed.retention"));
    }

    #[test]
    fn line_limit_is_configurable() {
        let cfg = StatfanConfig::from_toml_str("[ingest]\nmax_line_bytes = 512\n", Path::new("inline"))
            .unwrap();
        assert_eq!(cfg.ingest.max_line_bytes, 512);
        assert_eq!(StatfanConfig::default().ingest.max_line_bytes, DEFAULT_MAX_LINE_BYTES);

        let err = StatfanConfig::from_toml_str("[ingest]\nmax_line_bytes = 0\n", Path::new("inline"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "ingest.max_line_bytes"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StatfanConfig::from_toml_str("[feed]\nretension = 3\n", Path::new("x.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nlisten = \"0.0.0.0:9000\"\nseed_path = \"seed.json\"").unwrap();

        let cfg = StatfanConfig::load(file.path()).unwrap();
        assert_eq!(cfg.server.listen.port(), 9000);
        assert_eq!(cfg.server.seed_path.as_deref(), Some(Path::new("seed.json")));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = StatfanConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
