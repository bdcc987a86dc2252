//! # planboard-collab — Real-time collaboration server for Planboard
//!
//! Keeps every browser looking at a project board in sync: who is online,
//! who is editing which field, and what the task list currently holds.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ Browser     │ ◄─────────────────► │ CollabServer │
//! │ (per user)  │     JSON events     │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │   CollabHub   │
//!                                    ├───────────────┤
//!                                    │ Presence      │
//!                                    │ BroadcastGroup│
//!                                    │ LockTable     │
//!                                    └───────▲───────┘
//!                                            │ tasksUpdated
//!                                    ┌───────┴───────┐
//!                                    │ tasks.json    │
//!                                    │ (watched)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON event envelopes (`{"event", "data"}`)
//! - [`presence`] — Directory of live connections and their presence state
//! - [`broadcast`] — Per-connection outbound queues and fan-out
//! - [`locks`] — Field-level edit locks with expiry
//! - [`hub`] — Shared state and every state transition
//! - [`gateway`] — Handshake, admission and the per-connection loop
//! - [`watcher`] — Task store watcher and snapshot loading
//! - [`server`] — Accept loop and background tasks
//! - [`shutdown`] — Graceful shutdown signalling
//! - [`config`] / [`error`] — Configuration and error types

pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod locks;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod watcher;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use config::ServerConfig;
pub use error::{AdmitError, ConfigError, LockError, StoreError, WatchError};
pub use hub::{Admission, CollabHub, Credentials, EvictReason, ServerStats};
pub use locks::{LockRecord, LockTable};
pub use presence::{ConnectionRecord, PresenceDirectory};
pub use protocol::{ClientEvent, ConnectionId, LockRequest, ProtocolError, ServerEvent};
pub use server::CollabServer;
pub use shutdown::{wait_for_os_signal, ShutdownCoordinator, ShutdownSignal};
pub use watcher::{TaskFile, TaskSnapshot};
