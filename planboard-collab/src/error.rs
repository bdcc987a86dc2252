//! Error taxonomy for the collaboration server.
//!
//! Every error here is handled inside the component that detects it. Only
//! admission errors sever a connection; lock errors are reported back to the
//! requester as events and store errors are logged by the watcher.

use std::path::PathBuf;
use thiserror::Error;

/// Why a new connection was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("authentication failed")]
    Unauthorized,
    #[error("server at capacity ({max} connections)")]
    AtCapacity { max: usize },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Lock operations a requester is not allowed to perform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock not found")]
    NotFound { lock_id: String },
    #[error("not lock owner")]
    NotOwner { lock_id: String, owner: String },
}

impl LockError {
    pub fn lock_id(&self) -> &str {
        match self {
            Self::NotFound { lock_id } | Self::NotOwner { lock_id, .. } => lock_id,
        }
    }
}

/// Failure to read a task snapshot from the watched store file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{} holds neither a task array nor an object with a `tasks` array", .path.display())]
    InvalidFormat { path: PathBuf },
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Failure to set up the file watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("{} does not name a file", .0.display())]
    InvalidPath(PathBuf),
}
