//! Presence directory: who is online and what they are looking at.
//!
//! ## Architecture
//!
//! ```text
//! admit()  ──► PresenceDirectory::register()
//! inbound  ──► PresenceDirectory::touch()            (last_activity)
//! presenceUpdate ──► update_presence()  ──► merged payload ──► fan-out
//! evict()  ──► PresenceDirectory::unregister()
//! ```
//!
//! The directory is a plain map. It is only ever reached through the hub,
//! which serializes access, so it carries no locking of its own.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{ConnectionId, UserSummary};

// ───────────────────────────────────────────────────────────────────
// Connection record
// ───────────────────────────────────────────────────────────────────

/// Metadata for one admitted connection.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: String,
    /// Wall-clock admission time (epoch ms), shown to clients
    pub connected_at: u64,
    /// Monotonic time of the last inbound frame
    pub last_activity: Instant,
    pub remote_address: String,
    pub user_agent: Option<String>,
    /// Client-supplied cursor/selection state
    pub presence: Option<Value>,
}

impl ConnectionRecord {
    pub fn new(
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        remote_address: impl Into<String>,
        connected_at: u64,
    ) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            user_name: user_name.into(),
            connected_at,
            last_activity: Instant::now(),
            remote_address: remote_address.into(),
            user_agent: None,
            presence: None,
        }
    }

    /// Public view sent to other clients.
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            connection_id: self.connection_id,
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            connected_at: self.connected_at,
            presence: self.presence.clone(),
        }
    }

    /// Whether the connection has been silent for longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Shallow-merge `update` into `current`.
///
/// Object into object merges keys (a `null` value removes the key); anything
/// else replaces the stored value.
pub fn merge_presence(current: Option<Value>, update: Value) -> Value {
    match (current, update) {
        (Some(Value::Object(mut base)), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(&key);
                } else {
                    base.insert(key, value);
                }
            }
            Value::Object(base)
        }
        (_, Value::Object(patch)) => {
            let cleaned: Map<String, Value> =
                patch.into_iter().filter(|(_, v)| !v.is_null()).collect();
            Value::Object(cleaned)
        }
        (_, other) => other,
    }
}

// ───────────────────────────────────────────────────────────────────
// Directory
// ───────────────────────────────────────────────────────────────────

/// In-memory registry of live connections.
#[derive(Debug, Default)]
pub struct PresenceDirectory {
    records: HashMap<ConnectionId, ConnectionRecord>,
}

impl PresenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Replaces any previous record with the same id.
    pub fn register(&mut self, record: ConnectionRecord) {
        self.records.insert(record.connection_id, record);
    }

    pub fn unregister(&mut self, connection_id: &ConnectionId) -> Option<ConnectionRecord> {
        self.records.remove(connection_id)
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&ConnectionRecord> {
        self.records.get(connection_id)
    }

    /// All records, oldest connection first.
    pub fn list_all(&self) -> Vec<&ConnectionRecord> {
        let mut all: Vec<&ConnectionRecord> = self.records.values().collect();
        all.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.connection_id.cmp(&b.connection_id))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Refresh `last_activity`. Returns false for unknown connections.
    pub fn touch(&mut self, connection_id: &ConnectionId, now: Instant) -> bool {
        match self.records.get_mut(connection_id) {
            Some(record) => {
                record.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Merge a presence payload and return the merged value.
    pub fn update_presence(&mut self, connection_id: &ConnectionId, payload: Value) -> Option<Value> {
        let record = self.records.get_mut(connection_id)?;
        let merged = merge_presence(record.presence.take(), payload);
        record.presence = Some(merged.clone());
        Some(merged)
    }

    /// Connections silent for longer than `timeout` as of `now`.
    pub fn idle_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.records
            .values()
            .filter(|r| r.is_idle(now, timeout))
            .map(|r| r.connection_id)
            .collect()
    }

    /// Drop every record.
    pub fn clear(&mut self) -> Vec<ConnectionRecord> {
        self.records.drain().map(|(_, r)| r).collect()
    }
}
