//! The collaboration hub: presence, fan-out and locks behind one mutex.
//!
//! ```text
//!   socket tasks ──┐
//!   lock timers  ──┼──► CollabHub ──► Mutex<HubState>
//!   idle sweep   ──┤                   ├── PresenceDirectory
//!   file watcher ──┘                   ├── BroadcastGroup
//!                                      └── LockTable
//! ```
//!
//! Every operation takes the state mutex exactly once and runs to completion,
//! so transitions of a single lock key are totally ordered and no caller ever
//! sees a half-applied change. Sends only push into per-connection channels,
//! so nothing slow happens while the mutex is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::config::ServerConfig;
use crate::error::{AdmitError, LockError};
use crate::locks::{epoch_millis, Acquire, Extend, LockOwner, LockRecord, LockTable};
use crate::presence::{ConnectionRecord, PresenceDirectory};
use crate::protocol::{
    ClientEvent, Connected, ConnectionId, LockDenied, LockReleaseError, LockReleased,
    LockRequest, Pong, Relayed, ReleaseReason, ServerEvent, ServerNotice, UserLeft, UserSummary,
};
use crate::watcher::TaskSnapshot;

/// Close code sent to connections evicted for inactivity.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4408;

/// Identity a client presents during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub remote_address: String,
    pub user_agent: Option<String>,
}

/// A successfully admitted connection.
#[derive(Debug)]
pub struct Admission {
    pub connection_id: ConnectionId,
    pub user: UserSummary,
    /// Frames the socket task must write out
    pub outbound: mpsc::UnboundedReceiver<Message>,
}

/// Why a connection is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The client closed the socket
    ClientClosed,
    IdleTimeout,
    /// A read or write on the socket failed
    TransportError,
    Shutdown,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "disconnected",
            Self::IdleTimeout => "idle timeout",
            Self::TransportError => "transport error",
            Self::Shutdown => "server shutdown",
        }
    }

    /// Close frame to send, if the socket is still usable.
    pub fn close_frame(&self) -> Option<CloseFrame> {
        let code = match self {
            Self::ClientClosed | Self::TransportError => return None,
            Self::IdleTimeout => CloseCode::Library(CLOSE_IDLE_TIMEOUT),
            Self::Shutdown => CloseCode::Away,
        };
        Some(CloseFrame {
            code,
            reason: self.as_str().into(),
        })
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub evicted_connections: u64,
    pub total_messages: u64,
    pub locks_granted: u64,
    pub locks_denied: u64,
    pub locks_expired: u64,
    pub snapshots_broadcast: u64,
    /// Outbound frame counters, filled in by [`CollabHub::stats`].
    pub fanout: BroadcastStats,
}

#[derive(Debug, Default)]
struct HubState {
    presence: PresenceDirectory,
    group: BroadcastGroup,
    locks: LockTable,
    stats: ServerStats,
}

/// Shared core of the collaboration server.
pub struct CollabHub {
    config: ServerConfig,
    state: Mutex<HubState>,
    shutting_down: AtomicBool,
    /// Handle to ourselves for lock timers; they must not keep the hub alive.
    this: Weak<CollabHub>,
}

impl CollabHub {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            state: Mutex::new(HubState::default()),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    // ───────────────────────────────────────────────────────────────
    // Connection gateway
    // ───────────────────────────────────────────────────────────────

    /// Admit a new connection.
    ///
    /// Capacity is checked before the token so a full server never spends
    /// effort authenticating. Check and registration happen under one lock.
    pub async fn admit(&self, credentials: Credentials) -> Result<Admission, AdmitError> {
        let mut state = self.state.lock().await;

        if self.is_shutting_down() {
            return Err(AdmitError::ShuttingDown);
        }
        if state.presence.len() >= self.config.max_connections {
            state.stats.rejected_connections += 1;
            return Err(AdmitError::AtCapacity {
                max: self.config.max_connections,
            });
        }
        if let Some(expected) = &self.config.auth_token {
            if credentials.token.as_deref() != Some(expected.as_str()) {
                state.stats.rejected_connections += 1;
                return Err(AdmitError::Unauthorized);
            }
        }

        let connection_id = Uuid::new_v4();
        let user_id = credentials
            .user_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("user-{}", &connection_id.simple().to_string()[..8]));
        let user_name = credentials
            .user_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "Anonymous".to_string());

        let mut record = ConnectionRecord::new(
            connection_id,
            user_id,
            user_name,
            credentials.remote_address,
            epoch_millis(),
        );
        record.user_agent = credentials.user_agent;
        let user = record.summary();

        state.presence.register(record);
        let outbound = state.group.add_peer(connection_id);
        state.stats.total_connections += 1;
        state.stats.active_connections = state.presence.len() as u64;

        let connected = ServerEvent::Connected(Connected {
            connection_id,
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            server_time: epoch_millis(),
            users: state.presence.list_all().iter().map(|r| r.summary()).collect(),
            locks: state.locks.records(),
        });
        state.group.send_to(&connection_id, &connected);
        state
            .group
            .broadcast_except(&ServerEvent::UserJoined(user.clone()), &connection_id);
        self.settle(&mut state);

        log::info!(
            "User {} ({}) connected as {connection_id} [{} online]",
            user.user_name,
            user.user_id,
            state.presence.len()
        );

        Ok(Admission {
            connection_id,
            user,
            outbound,
        })
    }

    /// Record inbound activity.
    pub async fn heartbeat(&self, connection_id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        state.presence.touch(&connection_id, Instant::now())
    }

    /// Remove a connection, release its locks and tell everyone else.
    ///
    /// Returns false if the connection was already gone.
    pub async fn evict(&self, connection_id: ConnectionId, reason: EvictReason) -> bool {
        let mut state = self.state.lock().await;
        let evicted = Self::evict_locked(&mut state, connection_id, reason);
        self.settle(&mut state);
        evicted
    }

    /// Evict connections idle longer than the configured timeout, then ping
    /// the rest so live clients answer with a pong.
    pub async fn sweep_idle(&self, now: Instant) -> Vec<ConnectionId> {
        let mut state = self.state.lock().await;
        let idle = state
            .presence
            .idle_connections(now, self.config.idle_timeout);
        for id in &idle {
            log::info!("Evicting idle connection {id}");
            Self::evict_locked(&mut state, *id, EvictReason::IdleTimeout);
        }
        state.group.broadcast_raw(Message::Ping(Default::default()));
        self.settle(&mut state);
        idle
    }

    // ───────────────────────────────────────────────────────────────
    // Inbound events
    // ───────────────────────────────────────────────────────────────

    /// Dispatch one decoded client event.
    pub async fn handle_event(&self, connection_id: ConnectionId, event: ClientEvent) {
        log::trace!("{} from {connection_id}", event.name());
        match event {
            ClientEvent::RequestLock(request) => self.request_lock(connection_id, request).await,
            ClientEvent::ReleaseLock(request) => {
                // Denials are already reported to the requester.
                let _ = self.release_lock(connection_id, &request.lock_id).await;
            }
            ClientEvent::PresenceUpdate(payload) => {
                self.update_presence(connection_id, payload).await;
            }
            ClientEvent::CursorUpdate(payload) => {
                let mut patch = serde_json::Map::new();
                patch.insert("cursor".to_string(), payload.clone());
                self.relay(connection_id, payload, Some(Value::Object(patch)), Relay::Cursor)
                    .await;
            }
            ClientEvent::TaskUpdate(payload) => {
                self.relay(connection_id, payload, None, Relay::TaskUpdate).await;
            }
            ClientEvent::Typing(payload) => {
                self.relay(connection_id, payload, None, Relay::Typing).await;
            }
            ClientEvent::Notification(payload) => {
                self.relay(connection_id, payload, None, Relay::Notification).await;
            }
            ClientEvent::Ping => {
                let mut state = self.state.lock().await;
                state.stats.total_messages += 1;
                let pong = ServerEvent::Pong(Pong {
                    server_time: epoch_millis(),
                });
                state.group.send_to(&connection_id, &pong);
                self.settle(&mut state);
            }
        }
    }

    /// Merge a presence payload and broadcast the result to the others.
    pub async fn update_presence(&self, connection_id: ConnectionId, payload: Value) -> Option<Value> {
        let mut state = self.state.lock().await;
        state.stats.total_messages += 1;
        let merged = state.presence.update_presence(&connection_id, payload)?;
        let relayed = Self::relayed(&state, connection_id, merged.clone())?;
        state
            .group
            .broadcast_except(&ServerEvent::PresenceUpdate(relayed), &connection_id);
        self.settle(&mut state);
        Some(merged)
    }

    async fn relay(
        &self,
        connection_id: ConnectionId,
        payload: Value,
        presence_patch: Option<Value>,
        kind: Relay,
    ) {
        let mut state = self.state.lock().await;
        state.stats.total_messages += 1;
        if let Some(patch) = presence_patch {
            state.presence.update_presence(&connection_id, patch);
        }
        let Some(relayed) = Self::relayed(&state, connection_id, payload) else {
            return;
        };
        match kind {
            Relay::TaskUpdate => {
                state
                    .group
                    .broadcast_except(&ServerEvent::TaskUpdate(relayed), &connection_id);
            }
            Relay::Cursor => {
                state
                    .group
                    .broadcast_except(&ServerEvent::CursorUpdate(relayed), &connection_id);
            }
            Relay::Typing => {
                state
                    .group
                    .broadcast_except(&ServerEvent::UserTyping(relayed), &connection_id);
            }
            Relay::Notification => {
                state.group.broadcast_all(&ServerEvent::Notification(relayed));
            }
        }
        self.settle(&mut state);
    }

    fn relayed(state: &HubState, connection_id: ConnectionId, payload: Value) -> Option<Relayed> {
        let record = state.presence.get(&connection_id)?;
        Some(Relayed {
            connection_id,
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            payload,
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Lock manager
    // ───────────────────────────────────────────────────────────────

    /// Handle a `requestLock`, including extension.
    ///
    /// An extension of a missing or foreign lock falls through to a normal
    /// request: it is granted if the key is free and denied otherwise.
    pub async fn request_lock(&self, connection_id: ConnectionId, request: LockRequest) {
        let mut state = self.state.lock().await;
        state.stats.total_messages += 1;
        let Some(record) = state.presence.get(&connection_id) else {
            return;
        };
        let owner = LockOwner {
            connection_id,
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
        };
        let ttl = self.config.lock_ttl(request.timeout_ms);
        let ttl_ms = ttl.as_millis() as u64;
        let now_ms = epoch_millis();

        if request.extend {
            if let Extend::Extended { record, generation } =
                state
                    .locks
                    .extend(&request.lock_id, &connection_id, ttl_ms, now_ms)
            {
                self.arm_expiry(&mut state, &record, generation, now_ms);
                log::debug!("Lock {} extended until {}", record.lock_id, record.expires_at);
                state.group.broadcast_all(&ServerEvent::LockExtended(record));
                self.settle(&mut state);
                return;
            }
        }

        match state.locks.acquire(&request, &owner, ttl_ms, now_ms) {
            Acquire::Granted {
                record,
                generation,
                expired,
            } => {
                if let Some(stale) = expired {
                    state.stats.locks_expired += 1;
                    state.group.broadcast_all(&ServerEvent::LockReleased(LockReleased {
                        lock_id: stale.lock_id,
                        reason: ReleaseReason::Expired,
                    }));
                }
                self.arm_expiry(&mut state, &record, generation, now_ms);
                state.stats.locks_granted += 1;
                log::debug!("Lock {} granted to {}", record.lock_id, record.user_name);
                state.group.broadcast_all(&ServerEvent::LockGranted(record));
            }
            Acquire::Denied { holder } => {
                state.stats.locks_denied += 1;
                log::debug!(
                    "Lock {} denied to {}: held by {}",
                    holder.lock_id,
                    owner.user_name,
                    holder.user_name
                );
                let denied = ServerEvent::LockDenied(LockDenied {
                    lock_id: holder.lock_id,
                    locked_by: holder.user_name,
                    locked_by_user_id: holder.user_id,
                    expires_at: holder.expires_at,
                });
                state.group.send_to(&connection_id, &denied);
            }
        }
        self.settle(&mut state);
    }

    /// Voluntary release by the owner. Any failure is reported to the
    /// requester as `lockReleaseError`.
    pub async fn release_lock(
        &self,
        connection_id: ConnectionId,
        lock_id: &str,
    ) -> Result<LockRecord, LockError> {
        let mut state = self.state.lock().await;
        state.stats.total_messages += 1;
        let result = state.locks.release(lock_id, &connection_id);
        match &result {
            Ok(record) => {
                log::debug!("Lock {} released by {}", record.lock_id, record.user_name);
                state.group.broadcast_all(&ServerEvent::LockReleased(LockReleased {
                    lock_id: record.lock_id.clone(),
                    reason: ReleaseReason::Released,
                }));
            }
            Err(err) => {
                log::debug!("Release of {lock_id} by {connection_id} refused: {err}");
                let error = ServerEvent::LockReleaseError(LockReleaseError {
                    lock_id: err.lock_id().to_string(),
                    reason: err.to_string(),
                });
                state.group.send_to(&connection_id, &error);
            }
        }
        self.settle(&mut state);
        result
    }

    /// Forced release, regardless of owner.
    pub async fn release_internal(&self, lock_id: &str, reason: ReleaseReason) -> bool {
        let mut state = self.state.lock().await;
        let released = Self::release_internal_locked(&mut state, lock_id, reason);
        self.settle(&mut state);
        released
    }

    /// Forced release of every lock held by a connection.
    pub async fn release_all_owned_by(&self, connection_id: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        let released = Self::release_owned_locked(&mut state, &connection_id);
        self.settle(&mut state);
        released
    }

    /// Timer entry point. Stale generations are ignored.
    async fn expire_lock(&self, lock_id: &str, generation: u64) {
        if self.is_shutting_down() {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(record) = state.locks.expire(lock_id, generation) {
            state.stats.locks_expired += 1;
            log::debug!("Lock {} held by {} expired", record.lock_id, record.user_name);
            state.group.broadcast_all(&ServerEvent::LockReleased(LockReleased {
                lock_id: record.lock_id,
                reason: ReleaseReason::Expired,
            }));
            self.settle(&mut state);
        }
    }

    /// Arm the expiry timer for `record`. It fires at the advertised
    /// `expires_at`, which after an extension can be later than `now + ttl`.
    fn arm_expiry(
        &self,
        state: &mut HubState,
        record: &LockRecord,
        generation: u64,
        now_ms: u64,
    ) {
        let hub = self.this.clone();
        let key = record.lock_id.clone();
        let remaining = Duration::from_millis(record.expires_at.saturating_sub(now_ms));
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(hub) = hub.upgrade() {
                hub.expire_lock(&key, generation).await;
            }
        });
        state
            .locks
            .attach_timer(&record.lock_id, generation, timer.abort_handle());
    }

    fn release_internal_locked(state: &mut HubState, lock_id: &str, reason: ReleaseReason) -> bool {
        match state.locks.remove(lock_id) {
            Some(record) => {
                state.group.broadcast_all(&ServerEvent::LockReleased(LockReleased {
                    lock_id: record.lock_id,
                    reason,
                }));
                true
            }
            None => false,
        }
    }

    fn release_owned_locked(state: &mut HubState, connection_id: &ConnectionId) -> usize {
        let released = state.locks.release_all_owned_by(connection_id);
        for record in &released {
            state.group.broadcast_all(&ServerEvent::LockReleased(LockReleased {
                lock_id: record.lock_id.clone(),
                reason: ReleaseReason::Disconnected,
            }));
        }
        released.len()
    }

    // ───────────────────────────────────────────────────────────────
    // Task snapshots
    // ───────────────────────────────────────────────────────────────

    /// Broadcast a fresh task list to everyone.
    pub async fn broadcast_tasks(&self, snapshot: Arc<TaskSnapshot>) -> usize {
        let mut state = self.state.lock().await;
        let count = snapshot.len();
        let delivered = state.group.broadcast_all(&ServerEvent::TasksUpdated(snapshot));
        state.stats.snapshots_broadcast += 1;
        self.settle(&mut state);
        log::info!("Broadcast {count} tasks to {delivered} connections");
        delivered
    }

    /// Send the task list to one connection (late joiners).
    pub async fn send_tasks_to(&self, connection_id: ConnectionId, snapshot: Arc<TaskSnapshot>) -> bool {
        let mut state = self.state.lock().await;
        let sent = state
            .group
            .send_to(&connection_id, &ServerEvent::TasksUpdated(snapshot));
        self.settle(&mut state);
        sent
    }

    // ───────────────────────────────────────────────────────────────
    // Shutdown
    // ───────────────────────────────────────────────────────────────

    /// Notify everyone, close every connection and drop all locks.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock().await;

        let dropped = state.locks.clear();
        for record in &dropped {
            state.group.broadcast_all(&ServerEvent::LockReleased(LockReleased {
                lock_id: record.lock_id.clone(),
                reason: ReleaseReason::Shutdown,
            }));
        }
        let notice = ServerEvent::ServerShutdown(ServerNotice {
            message: "Server is shutting down".to_string(),
            server_time: epoch_millis(),
        });
        let notified = state.group.broadcast_all(&notice);

        for record in state.presence.clear() {
            state
                .group
                .close(&record.connection_id, EvictReason::Shutdown.close_frame());
        }
        for id in state.group.take_pruned() {
            state.group.remove_peer(&id);
        }
        state.stats.active_connections = 0;

        log::info!(
            "Shutdown: notified {notified} connections, dropped {} locks",
            dropped.len()
        );
        true
    }

    // ───────────────────────────────────────────────────────────────
    // Introspection
    // ───────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> ServerStats {
        let state = self.state.lock().await;
        ServerStats {
            fanout: state.group.stats(),
            ..state.stats.clone()
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.presence.len()
    }

    pub async fn online_users(&self) -> Vec<UserSummary> {
        let state = self.state.lock().await;
        state.presence.list_all().iter().map(|r| r.summary()).collect()
    }

    pub async fn active_locks(&self) -> Vec<LockRecord> {
        self.state.lock().await.locks.records()
    }

    // ───────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────

    fn evict_locked(state: &mut HubState, connection_id: ConnectionId, reason: EvictReason) -> bool {
        let Some(record) = state.presence.unregister(&connection_id) else {
            state.group.remove_peer(&connection_id);
            return false;
        };

        // Close first so the leaving socket gets nothing after its close frame.
        if !state.group.close(&connection_id, reason.close_frame()) {
            state.group.remove_peer(&connection_id);
        }
        let released = Self::release_owned_locked(state, &connection_id);

        let left = ServerEvent::UserLeft(UserLeft {
            connection_id,
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            reason: reason.as_str().to_string(),
        });
        state.group.broadcast_all(&left);

        state.stats.active_connections = state.presence.len() as u64;
        if reason != EvictReason::ClientClosed {
            state.stats.evicted_connections += 1;
        }
        log::info!(
            "User {} ({connection_id}) left: {} [{released} locks released, {} online]",
            record.user_name,
            reason.as_str(),
            state.presence.len()
        );
        true
    }

    /// Finish evicting connections whose channels turned out to be closed.
    /// Each eviction broadcasts, which may prune more, so loop until quiet.
    fn settle(&self, state: &mut HubState) {
        loop {
            let pruned = state.group.take_pruned();
            if pruned.is_empty() {
                break;
            }
            for id in pruned {
                Self::evict_locked(state, id, EvictReason::TransportError);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Relay {
    TaskUpdate,
    Cursor,
    Typing,
    Notification,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub_with(max_connections: usize, auth_token: Option<&str>) -> Arc<CollabHub> {
        CollabHub::new(ServerConfig {
            max_connections,
            auth_token: auth_token.map(str::to_string),
            ..ServerConfig::default()
        })
    }

    fn creds(name: &str) -> Credentials {
        Credentials {
            user_id: Some(format!("u-{name}")),
            user_name: Some(name.to_string()),
            remote_address: "127.0.0.1:9".to_string(),
            ..Credentials::default()
        }
    }

    /// Drain queued frames as parsed JSON envelopes.
    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Text(text) => out.push(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => out.push(json!({"event": "__close"})),
                _ => {}
            }
        }
        out
    }

    fn events(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn lock_request(extend: bool) -> LockRequest {
        LockRequest {
            lock_id: "task-1.title".into(),
            resource_type: "task".into(),
            resource_id: json!(1),
            field: "title".into(),
            timeout_ms: Some(30_000),
            extend,
        }
    }

    #[tokio::test]
    async fn test_admit_sends_connected_and_user_joined() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();

        let a = drain(&mut alice.outbound);
        assert_eq!(events(&a), vec!["connected", "userJoined"]);
        assert_eq!(a[1]["data"]["userName"], "Bob");

        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["connected"]);
        assert_eq!(b[0]["data"]["connectionId"], bob.connection_id.to_string());
        assert_eq!(b[0]["data"]["users"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_admit_generates_identity_when_missing() {
        let hub = hub_with(10, None);
        let admission = hub.admit(Credentials::default()).await.unwrap();
        assert!(admission.user.user_id.starts_with("user-"));
        assert_eq!(admission.user.user_name, "Anonymous");
    }

    #[tokio::test]
    async fn test_capacity_rejection() {
        let hub = hub_with(2, None);
        let _a = hub.admit(creds("A")).await.unwrap();
        let _b = hub.admit(creds("B")).await.unwrap();
        assert_eq!(
            hub.admit(creds("C")).await.unwrap_err(),
            AdmitError::AtCapacity { max: 2 }
        );
        assert_eq!(hub.connection_count().await, 2);
        assert_eq!(hub.stats().await.rejected_connections, 1);
    }

    #[tokio::test]
    async fn test_stats_include_fanout_counters() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let bob = hub.admit(creds("Bob")).await.unwrap();
        drop(bob.outbound);

        hub.handle_event(alice.connection_id, ClientEvent::Notification(json!("standup")))
            .await;
        let stats = hub.stats().await;
        assert_eq!(stats.fanout.messages_dropped, 1);
        assert_eq!(stats.fanout.active_peers, 1);
        assert!(stats.fanout.messages_sent >= 4);
        let a = events(&drain(&mut alice.outbound));
        assert_eq!(a[..3], ["connected", "userJoined", "notification"]);
    }

    #[tokio::test]
    async fn test_token_checked_only_when_configured() {
        let hub = hub_with(10, Some("s3cret"));
        assert_eq!(
            hub.admit(creds("Mallory")).await.unwrap_err(),
            AdmitError::Unauthorized
        );
        let mut good = creds("Alice");
        good.token = Some("s3cret".into());
        assert!(hub.admit(good).await.is_ok());

        let open = hub_with(10, None);
        assert!(open.admit(creds("Anyone")).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_granted_then_denied() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        hub.request_lock(alice.connection_id, lock_request(false)).await;
        let a = drain(&mut alice.outbound);
        assert_eq!(events(&a), vec!["lockGranted"]);
        assert_eq!(events(&drain(&mut bob.outbound)), vec!["lockGranted"]);

        hub.request_lock(bob.connection_id, lock_request(false)).await;
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["lockDenied"]);
        assert_eq!(b[0]["data"]["lockedBy"], "Alice");
        assert_eq!(b[0]["data"]["expiresAt"], a[0]["data"]["expiresAt"]);
        // Denial goes to the requester only.
        assert!(drain(&mut alice.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_single_grant() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        let (h1, h2) = (hub.clone(), hub.clone());
        let (a_id, b_id) = (alice.connection_id, bob.connection_id);
        let t1 = tokio::spawn(async move { h1.request_lock(a_id, lock_request(false)).await });
        let t2 = tokio::spawn(async move { h2.request_lock(b_id, lock_request(false)).await });
        t1.await.unwrap();
        t2.await.unwrap();

        let mut all = drain(&mut alice.outbound);
        all.extend(drain(&mut bob.outbound));
        let names = events(&all);
        // One grant seen by both, one denial seen by the loser.
        assert_eq!(names.iter().filter(|e| *e == "lockGranted").count(), 2);
        assert_eq!(names.iter().filter(|e| *e == "lockDenied").count(), 1);
        assert_eq!(hub.active_locks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_extend_by_owner_broadcasts_later_expiry() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        let granted = drain(&mut alice.outbound).pop().unwrap();
        drain(&mut bob.outbound);

        tokio::time::sleep(Duration::from_millis(5)).await;
        hub.request_lock(alice.connection_id, lock_request(true)).await;
        let a = drain(&mut alice.outbound);
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&a), vec!["lockExtended"]);
        assert_eq!(events(&b), vec!["lockExtended"]);
        assert!(
            a[0]["data"]["expiresAt"].as_u64().unwrap()
                > granted["data"]["expiresAt"].as_u64().unwrap()
        );

        hub.request_lock(bob.connection_id, lock_request(false)).await;
        assert_eq!(events(&drain(&mut bob.outbound)), vec!["lockDenied"]);
    }

    #[tokio::test]
    async fn test_extend_foreign_lock_falls_through_to_denial() {
        let hub = hub_with(10, None);
        let alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        let before = hub.active_locks().await;
        drain(&mut bob.outbound);

        hub.request_lock(bob.connection_id, lock_request(true)).await;
        assert_eq!(events(&drain(&mut bob.outbound)), vec!["lockDenied"]);
        assert_eq!(hub.active_locks().await, before);
    }

    #[tokio::test]
    async fn test_extend_missing_lock_falls_through_to_grant() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        drain(&mut alice.outbound);

        hub.request_lock(alice.connection_id, lock_request(true)).await;
        assert_eq!(events(&drain(&mut alice.outbound)), vec!["lockGranted"]);
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_error() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        let err = hub
            .release_lock(bob.connection_id, "task-1.title")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["lockReleaseError"]);
        assert_eq!(b[0]["data"]["reason"], "not lock owner");
        assert!(drain(&mut alice.outbound).is_empty());
        assert_eq!(hub.active_locks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_absent_lock_repeatedly() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        assert!(hub.release_lock(alice.connection_id, "task-1.title").await.is_ok());
        drain(&mut alice.outbound);

        for _ in 0..3 {
            let err = hub
                .release_lock(alice.connection_id, "task-1.title")
                .await
                .unwrap_err();
            assert!(matches!(err, LockError::NotFound { .. }));
        }
        let frames = drain(&mut alice.outbound);
        assert_eq!(events(&frames), vec!["lockReleaseError"; 3]);
        assert_eq!(frames[0]["data"]["reason"], "lock not found");
    }

    #[tokio::test]
    async fn test_lock_expires_and_key_becomes_free() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        let mut short = lock_request(false);
        short.timeout_ms = Some(50);
        hub.request_lock(alice.connection_id, short).await;
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["lockReleased"]);
        assert_eq!(b[0]["data"]["reason"], "expired");
        assert!(hub.active_locks().await.is_empty());

        hub.request_lock(bob.connection_id, lock_request(false)).await;
        assert_eq!(events(&drain(&mut bob.outbound)), vec!["lockGranted"]);
    }

    #[tokio::test]
    async fn test_extend_cancels_previous_timer() {
        let hub = hub_with(10, None);
        let alice = hub.admit(creds("Alice")).await.unwrap();
        let mut short = lock_request(false);
        short.timeout_ms = Some(100);
        hub.request_lock(alice.connection_id, short).await;

        let mut longer = lock_request(true);
        longer.timeout_ms = Some(10_000);
        hub.request_lock(alice.connection_id, longer).await;

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(hub.active_locks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_short_extend_keeps_lock_until_advertised_expiry() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        let mut long = lock_request(false);
        long.timeout_ms = Some(2_000);
        hub.request_lock(alice.connection_id, long).await;
        let granted = drain(&mut alice.outbound).pop().unwrap();

        let mut short = lock_request(true);
        short.timeout_ms = Some(50);
        hub.request_lock(alice.connection_id, short).await;
        let extended = drain(&mut alice.outbound).pop().unwrap();
        assert_eq!(extended["event"], "lockExtended");
        assert!(
            extended["data"]["expiresAt"].as_u64().unwrap()
                > granted["data"]["expiresAt"].as_u64().unwrap()
        );
        drain(&mut bob.outbound);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hub.active_locks().await.len(), 1);
        assert!(drain(&mut bob.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_releases_locks_before_user_left() {
        let hub = hub_with(10, None);
        let alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        let mut second = lock_request(false);
        second.lock_id = "task-1.description".into();
        hub.request_lock(alice.connection_id, second).await;
        drain(&mut bob.outbound);

        assert!(hub.evict(alice.connection_id, EvictReason::ClientClosed).await);
        assert!(!hub.evict(alice.connection_id, EvictReason::ClientClosed).await);

        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["lockReleased", "lockReleased", "userLeft"]);
        assert_eq!(b[0]["data"]["reason"], "disconnected");
        assert_eq!(b[2]["data"]["userName"], "Alice");
        assert!(hub.active_locks().await.is_empty());

        hub.request_lock(bob.connection_id, lock_request(false)).await;
        assert_eq!(events(&drain(&mut bob.outbound)), vec!["lockGranted"]);
    }

    #[tokio::test]
    async fn test_dead_channel_pruned_and_evicted() {
        let hub = hub_with(10, None);
        let alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        drop(alice.outbound);
        drain(&mut bob.outbound);

        hub.handle_event(bob.connection_id, ClientEvent::Notification(json!("hi")))
            .await;

        assert_eq!(hub.connection_count().await, 1);
        assert!(hub.active_locks().await.is_empty());
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["notification", "lockReleased", "userLeft"]);
        assert_eq!(b[2]["data"]["reason"], "transport error");
    }

    #[tokio::test]
    async fn test_idle_sweep_evicts_and_pings() {
        let hub = hub_with(10, None);
        let mut stale = hub.admit(creds("Stale")).await.unwrap();
        let mut fresh = hub.admit(creds("Fresh")).await.unwrap();
        drain(&mut stale.outbound);
        drain(&mut fresh.outbound);

        // Pretend two minutes and change have passed, but Fresh spoke just now.
        let later = Instant::now() + Duration::from_secs(121);
        {
            let mut state = hub.state.lock().await;
            state.presence.touch(&fresh.connection_id, later);
        }
        let evicted = hub.sweep_idle(later).await;
        assert_eq!(evicted, vec![stale.connection_id]);

        let s = drain(&mut stale.outbound);
        assert_eq!(events(&s), vec!["__close"]);
        let mut saw_ping = false;
        let mut fresh_events = Vec::new();
        while let Ok(msg) = fresh.outbound.try_recv() {
            match msg {
                Message::Ping(_) => saw_ping = true,
                Message::Text(text) => {
                    let v: Value = serde_json::from_str(text.as_str()).unwrap();
                    fresh_events.push(v["data"]["reason"].clone());
                }
                _ => {}
            }
        }
        assert!(saw_ping);
        assert_eq!(fresh_events, vec![json!("idle timeout")]);
    }

    #[tokio::test]
    async fn test_presence_update_merges_and_skips_originator() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        hub.update_presence(alice.connection_id, json!({"viewing": 3})).await;
        hub.handle_event(alice.connection_id, ClientEvent::CursorUpdate(json!({"x": 1})))
            .await;

        assert!(drain(&mut alice.outbound).is_empty());
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["presenceUpdate", "cursorUpdate"]);
        assert_eq!(b[0]["data"]["payload"], json!({"viewing": 3}));
        assert_eq!(b[0]["data"]["userName"], "Alice");

        let users = hub.online_users().await;
        let alice_view = users.iter().find(|u| u.user_name == "Alice").unwrap();
        assert_eq!(alice_view.presence, Some(json!({"viewing": 3, "cursor": {"x": 1}})));
    }

    #[tokio::test]
    async fn test_relay_routing() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        drain(&mut alice.outbound);
        drain(&mut bob.outbound);

        hub.handle_event(alice.connection_id, ClientEvent::TaskUpdate(json!({"id": 1})))
            .await;
        hub.handle_event(alice.connection_id, ClientEvent::Typing(json!({"taskId": 1})))
            .await;
        hub.handle_event(alice.connection_id, ClientEvent::Notification(json!("done")))
            .await;
        hub.handle_event(alice.connection_id, ClientEvent::Ping).await;

        assert_eq!(
            events(&drain(&mut alice.outbound)),
            vec!["notification", "pong"]
        );
        let b = drain(&mut bob.outbound);
        assert_eq!(events(&b), vec!["taskUpdate", "userTyping", "notification"]);
        assert_eq!(b[0]["data"]["payload"], json!({"id": 1}));
        assert_eq!(b[0]["data"]["userId"], "u-Alice");
    }

    #[tokio::test]
    async fn test_broadcast_tasks_and_late_joiner() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        drain(&mut alice.outbound);

        let snapshot = Arc::new(TaskSnapshot::new(vec![json!({"id": 1}), json!({"id": 2})]));
        assert_eq!(hub.broadcast_tasks(snapshot.clone()).await, 1);
        let a = drain(&mut alice.outbound);
        assert_eq!(events(&a), vec!["tasksUpdated"]);
        assert_eq!(a[0]["data"], json!([{"id": 1}, {"id": 2}]));

        let mut bob = hub.admit(creds("Bob")).await.unwrap();
        drain(&mut bob.outbound);
        assert!(hub.send_tasks_to(bob.connection_id, snapshot).await);
        assert_eq!(events(&drain(&mut bob.outbound)), vec!["tasksUpdated"]);
        assert!(drain(&mut alice.outbound).iter().all(|f| f["event"] != "tasksUpdated"));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let hub = hub_with(10, None);
        let mut alice = hub.admit(creds("Alice")).await.unwrap();
        hub.request_lock(alice.connection_id, lock_request(false)).await;
        drain(&mut alice.outbound);

        assert!(hub.shutdown().await);
        assert!(!hub.shutdown().await);

        let a = drain(&mut alice.outbound);
        assert_eq!(events(&a), vec!["lockReleased", "serverShutdown", "__close"]);
        assert_eq!(a[0]["data"]["reason"], "shutdown");
        assert_eq!(hub.connection_count().await, 0);
        assert!(hub.active_locks().await.is_empty());
        assert_eq!(
            hub.admit(creds("Late")).await.unwrap_err(),
            AdmitError::ShuttingDown
        );
    }
}
