//! Short-lived advisory edit locks.
//!
//! State machine per lock key:
//! ```text
//!            acquire                 extend (owner)
//!  absent ─────────────► granted ◄──────────────┐
//!    ▲                      │ │                  │
//!    │   release (owner)    │ └──────────────────┘
//!    ├──────────────────────┤
//!    │   expire (timer)     │
//!    ├──────────────────────┤
//!    │   owner disconnect   │
//!    └──────────────────────┘
//! ```
//!
//! [`LockTable`] is pure bookkeeping: callers pass the wall-clock time in and
//! receive outcomes back, which keeps every transition testable without
//! sleeping. Expiry timers are spawned by the hub and parked here as
//! [`AbortHandle`]s; every transition that retires a grant aborts its timer.
//! Each grant or extension gets a fresh generation number so a timer that
//! fires late can never expire a newer grant.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::AbortHandle;

use crate::error::LockError;
use crate::protocol::{ConnectionId, LockRequest};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A granted lock as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub lock_id: String,
    pub user_id: String,
    pub user_name: String,
    pub connection_id: ConnectionId,
    pub resource_type: String,
    pub resource_id: Value,
    pub field: String,
    pub granted_at: u64,
    pub expires_at: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Who is asking for a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: String,
}

/// Result of [`LockTable::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    Granted {
        record: LockRecord,
        generation: u64,
        /// A stale record that was cleared to make room for this grant
        expired: Option<LockRecord>,
    },
    Denied {
        holder: LockRecord,
    },
}

/// Result of [`LockTable::extend`].
#[derive(Debug, Clone, PartialEq)]
pub enum Extend {
    Extended { record: LockRecord, generation: u64 },
    /// Missing or foreign lock; nothing changed.
    NotExtended,
}

#[derive(Debug)]
struct LockEntry {
    record: LockRecord,
    generation: u64,
    timer: Option<AbortHandle>,
}

impl LockEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// The lock table. At most one entry per lock key.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<String, LockEntry>,
    next_generation: u64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `request.lock_id` to `owner` unless someone holds it.
    ///
    /// A record whose `expires_at` has passed is treated as absent even if
    /// its timer has not run yet.
    pub fn acquire(
        &mut self,
        request: &LockRequest,
        owner: &LockOwner,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Acquire {
        let mut expired = None;
        if let Some(entry) = self.entries.get(&request.lock_id) {
            if !entry.record.is_expired(now_ms) {
                return Acquire::Denied {
                    holder: entry.record.clone(),
                };
            }
            expired = self.remove(&request.lock_id);
        }

        let record = LockRecord {
            lock_id: request.lock_id.clone(),
            user_id: owner.user_id.clone(),
            user_name: owner.user_name.clone(),
            connection_id: owner.connection_id,
            resource_type: request.resource_type.clone(),
            resource_id: request.resource_id.clone(),
            field: request.field.clone(),
            granted_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
        };
        let generation = self.bump_generation();
        self.entries.insert(
            record.lock_id.clone(),
            LockEntry {
                record: record.clone(),
                generation,
                timer: None,
            },
        );

        Acquire::Granted {
            record,
            generation,
            expired,
        }
    }

    /// Push back the expiry of a lock owned by `connection_id`.
    ///
    /// The new expiry is `now + ttl`, but never earlier than one millisecond
    /// past the previous expiry. The old timer is aborted; the caller arms a
    /// new one for the returned generation.
    pub fn extend(
        &mut self,
        lock_id: &str,
        connection_id: &ConnectionId,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Extend {
        let generation = self.next_generation + 1;
        let Some(entry) = self.entries.get_mut(lock_id) else {
            return Extend::NotExtended;
        };
        if entry.record.connection_id != *connection_id || entry.record.is_expired(now_ms) {
            return Extend::NotExtended;
        }

        entry.cancel_timer();
        entry.record.expires_at = now_ms
            .saturating_add(ttl_ms)
            .max(entry.record.expires_at.saturating_add(1));
        entry.generation = generation;
        let record = entry.record.clone();
        self.next_generation = generation;

        Extend::Extended { record, generation }
    }

    /// Voluntary release by the owner.
    pub fn release(
        &mut self,
        lock_id: &str,
        connection_id: &ConnectionId,
    ) -> Result<LockRecord, LockError> {
        let entry = self.entries.get(lock_id).ok_or_else(|| LockError::NotFound {
            lock_id: lock_id.to_string(),
        })?;
        if entry.record.connection_id != *connection_id {
            return Err(LockError::NotOwner {
                lock_id: lock_id.to_string(),
                owner: entry.record.user_name.clone(),
            });
        }
        self.remove(lock_id).ok_or_else(|| LockError::NotFound {
            lock_id: lock_id.to_string(),
        })
    }

    /// Unconditional removal; aborts the pending timer.
    pub fn remove(&mut self, lock_id: &str) -> Option<LockRecord> {
        let mut entry = self.entries.remove(lock_id)?;
        entry.cancel_timer();
        Some(entry.record)
    }

    /// Timer-driven removal. Ignored unless `generation` is still current.
    pub fn expire(&mut self, lock_id: &str, generation: u64) -> Option<LockRecord> {
        match self.entries.get(lock_id) {
            Some(entry) if entry.generation == generation => {}
            _ => return None,
        }
        // The firing timer is the caller; drop its handle without aborting.
        self.entries.remove(lock_id).map(|entry| entry.record)
    }

    /// Park the expiry timer of a grant.
    ///
    /// If the grant has already been superseded the timer is aborted at once.
    pub fn attach_timer(&mut self, lock_id: &str, generation: u64, timer: AbortHandle) -> bool {
        match self.entries.get_mut(lock_id) {
            Some(entry) if entry.generation == generation => {
                entry.cancel_timer();
                entry.timer = Some(timer);
                true
            }
            _ => {
                timer.abort();
                false
            }
        }
    }

    /// Remove every lock owned by `connection_id`, in key order.
    pub fn release_all_owned_by(&mut self, connection_id: &ConnectionId) -> Vec<LockRecord> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.record.connection_id == *connection_id)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys.iter().filter_map(|k| self.remove(k)).collect()
    }

    /// Remove everything, aborting all timers.
    pub fn clear(&mut self) -> Vec<LockRecord> {
        let mut records: Vec<LockRecord> = self
            .entries
            .drain()
            .map(|(_, mut entry)| {
                entry.cancel_timer();
                entry.record
            })
            .collect();
        records.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        records
    }

    pub fn get(&self, lock_id: &str) -> Option<&LockRecord> {
        self.entries.get(lock_id).map(|e| &e.record)
    }

    /// Active records in key order.
    pub fn records(&self) -> Vec<LockRecord> {
        let mut records: Vec<LockRecord> = self.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}
