//! JSON event protocol spoken over the WebSocket.
//!
//! Every text frame is one envelope:
//! ```text
//! { "event": "<name>", "data": <payload> }
//! ```
//!
//! Inbound frames decode into [`ClientEvent`]; outbound frames are built from
//! [`ServerEvent`]. Payloads the server only relays stay opaque
//! `serde_json::Value`s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::locks::LockRecord;
use crate::watcher::TaskSnapshot;

/// Identity of one live transport session.
pub type ConnectionId = Uuid;

/// Raw envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Payload of an inbound `requestLock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub lock_id: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_id: Value,
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub extend: bool,
}

/// Payload of an inbound `releaseLock`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub lock_id: String,
}

/// Events a browser client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    TaskUpdate(Value),
    PresenceUpdate(Value),
    CursorUpdate(Value),
    RequestLock(LockRequest),
    ReleaseLock(ReleaseRequest),
    Typing(Value),
    Notification(Value),
    Ping,
}

impl ClientEvent {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        let event = match envelope.event.as_str() {
            "taskUpdate" => Self::TaskUpdate(envelope.data),
            "presenceUpdate" => Self::PresenceUpdate(envelope.data),
            "cursorUpdate" => Self::CursorUpdate(envelope.data),
            "requestLock" => Self::RequestLock(
                serde_json::from_value(envelope.data)
                    .map_err(|e| ProtocolError::InvalidPayload("requestLock", e.to_string()))?,
            ),
            "releaseLock" => Self::ReleaseLock(
                serde_json::from_value(envelope.data)
                    .map_err(|e| ProtocolError::InvalidPayload("releaseLock", e.to_string()))?,
            ),
            "typing" => Self::Typing(envelope.data),
            "notification" => Self::Notification(envelope.data),
            "ping" => Self::Ping,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskUpdate(_) => "taskUpdate",
            Self::PresenceUpdate(_) => "presenceUpdate",
            Self::CursorUpdate(_) => "cursorUpdate",
            Self::RequestLock(_) => "requestLock",
            Self::ReleaseLock(_) => "releaseLock",
            Self::Typing(_) => "typing",
            Self::Notification(_) => "notification",
            Self::Ping => "ping",
        }
    }
}

/// Public view of a connected user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: String,
    pub connected_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// Sent to a newly admitted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: String,
    pub server_time: u64,
    /// Everyone online, including the new connection
    pub users: Vec<UserSummary>,
    /// Locks held at admission time
    pub locks: Vec<LockRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: String,
    pub reason: String,
}

/// A client event relayed to other connections, stamped with the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relayed {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub user_name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDenied {
    pub lock_id: String,
    pub locked_by: String,
    pub locked_by_user_id: String,
    pub expires_at: u64,
}

/// Why a lock went back to absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleaseReason {
    Released,
    Expired,
    Disconnected,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReleased {
    pub lock_id: String,
    pub reason: ReleaseReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReleaseError {
    pub lock_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerNotice {
    pub message: String,
    pub server_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub server_time: u64,
}

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Connected(Connected),
    UserJoined(UserSummary),
    UserLeft(UserLeft),
    TasksUpdated(std::sync::Arc<TaskSnapshot>),
    TaskUpdate(Relayed),
    PresenceUpdate(Relayed),
    CursorUpdate(Relayed),
    UserTyping(Relayed),
    Notification(Relayed),
    LockGranted(LockRecord),
    LockExtended(LockRecord),
    LockDenied(LockDenied),
    LockReleased(LockReleased),
    LockReleaseError(LockReleaseError),
    ServerShutdown(ServerNotice),
    Pong(Pong),
}

impl ServerEvent {
    /// Serialize to the JSON envelope.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Serialize into a ready-to-send text frame.
    pub fn to_message(&self) -> Result<Message, ProtocolError> {
        Ok(Message::text(self.encode()?))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
    #[error("Invalid {0} payload: {1}")]
    InvalidPayload(&'static str, String),
}
