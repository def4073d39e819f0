//! Full-state snapshots.
//!
//! The feed only ever carries recent changes. Readers that fall too far
//! behind (or are told to reload) fetch the authoritative state from a
//! [`SnapshotProvider`] and restart their cursor from the `evq` pair served
//! with it.
//!
//! [`StatusBoard`] is the in-process provider: it keeps the web UI config,
//! per-server configuration, the latest status per server, the rotate
//! (round-robin DNS pool) definitions, and the latest poll log per server.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SnapshotError;

/// Authoritative full state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Web UI configuration, passed through untouched.
    pub cfg: Value,
    /// One object per server, each with its `id`.
    pub servers: Vec<Value>,
    /// DNS rotation groups.
    pub rotates: Vec<Value>,
}

/// Latest poll log of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityLog {
    /// When the log was stored.
    pub t: DateTime<Utc>,
    /// The log text.
    pub log: String,
}

/// Source of full-state snapshots and per-entity logs.
///
/// Implementations must be safe to call from many request handlers at once.
pub trait SnapshotProvider: Send + Sync {
    /// The full current state.
    fn snapshot(&self) -> Result<Snapshot, SnapshotError>;

    /// The latest log stored for entity `id`, if any.
    fn entity_log(&self, id: &str) -> Result<Option<EntityLog>, SnapshotError>;
}

#[derive(Debug, Default)]
struct ServerRecord {
    config: Option<Value>,
    status: Option<Value>,
    log: Option<EntityLog>,
}

impl ServerRecord {
    fn is_vacant(&self) -> bool {
        self.config.is_none() && self.status.is_none() && self.log.is_none()
    }
}

#[derive(Debug)]
struct Board {
    cfg: Value,
    servers: BTreeMap<String, ServerRecord>,
    rotates: Vec<Value>,
}

/// Thread-safe in-memory snapshot provider.
#[derive(Debug)]
pub struct StatusBoard {
    inner: RwLock<Board>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    /// Empty board with `{}` as web config.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Board {
                cfg: Value::Object(serde_json::Map::new()),
                servers: BTreeMap::new(),
                rotates: Vec::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Board> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Board> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the web UI config block.
    pub fn set_web_config(&self, cfg: Value) {
        self.write().cfg = cfg;
    }

    /// Insert or replace a server's configuration.
    pub fn upsert_server(&self, id: &str, config: Value) {
        self.write().servers.entry(id.to_string()).or_default().config = Some(config);
    }

    /// Forget a server entirely: config, status and log.
    pub fn remove_server(&self, id: &str) -> bool {
        self.write().servers.remove(id).is_some()
    }

    /// Replace the rotate definitions.
    pub fn set_rotates(&self, rotates: Vec<Value>) {
        self.write().rotates = rotates;
    }

    /// Record the latest status message for a server.
    pub fn record_status(&self, id: &str, status: Value) {
        self.write().servers.entry(id.to_string()).or_default().status = Some(status);
    }

    /// Store the latest poll log for a server, stamped now.
    pub fn store_log(&self, id: &str, log: impl Into<String>) {
        self.store_log_at(id, log, Utc::now());
    }

    /// Store the latest poll log for a server with an explicit timestamp.
    pub fn store_log_at(&self, id: &str, log: impl Into<String>, t: DateTime<Utc>) {
        self.write().servers.entry(id.to_string()).or_default().log = Some(EntityLog {
            t,
            log: log.into(),
        });
    }

    /// Number of known servers.
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.read().servers.values().filter(|r| !r.is_vacant()).count()
    }

    /// Load `{cfg, servers, rotates}` from a seed document.
    ///
    /// `servers` may be an array of objects carrying an `"id"`, or an object
    /// keyed by id. Missing sections are left untouched. Returns the number of
    /// servers loaded.
    pub fn seed_from_json(&self, seed: &Value) -> Result<usize, SnapshotError> {
        let Some(doc) = seed.as_object() else {
            return Err(SnapshotError::Serialization {
                message: "seed document must be a JSON object".to_string(),
            });
        };

        let servers: Vec<(String, Value)> = match doc.get("servers") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(Value::Array(list)) => list
                .iter()
                .map(|v| {
                    v.get("id")
                        .and_then(Value::as_str)
                        .map(|id| (id.to_string(), v.clone()))
                        .ok_or_else(|| SnapshotError::Serialization {
                            message: "seed server entry without string \"id\"".to_string(),
                        })
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(SnapshotError::Serialization {
                    message: format!("seed \"servers\" must be an array or object, got {other}"),
                })
            }
        };

        let rotates = match doc.get("rotates") {
            None => None,
            Some(Value::Array(list)) => Some(list.clone()),
            Some(Value::Object(map)) => Some(map.values().cloned().collect()),
            Some(_) => {
                return Err(SnapshotError::Serialization {
                    message: "seed \"rotates\" must be an array or object".to_string(),
                })
            }
        };

        let mut board = self.write();
        if let Some(cfg) = doc.get("cfg") {
            board.cfg = cfg.clone();
        }
        if let Some(rotates) = rotates {
            board.rotates = rotates;
        }
        let n = servers.len();
        for (id, config) in servers {
            board.servers.entry(id).or_default().config = Some(config);
        }
        Ok(n)
    }
}

impl SnapshotProvider for StatusBoard {
    fn snapshot(&self) -> Result<Snapshot, SnapshotError> {
        let board = self.read();
        let servers = board
            .servers
            .iter()
            .filter(|(_, r)| !r.is_vacant())
            .map(|(id, r)| {
                serde_json::json!({
                    "id": id,
                    "config": r.config.clone().unwrap_or(Value::Null),
                    "status": r.status.clone().unwrap_or(Value::Null),
                })
            })
            .collect();

        Ok(Snapshot {
            cfg: board.cfg.clone(),
            servers,
            rotates: board.rotates.clone(),
        })
    }

    fn entity_log(&self, id: &str) -> Result<Option<EntityLog>, SnapshotError> {
        Ok(self.read().servers.get(id).and_then(|r| r.log.clone()))
    }
}
