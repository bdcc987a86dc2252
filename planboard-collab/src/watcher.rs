//! External change watcher for the task store file.
//!
//! ```text
//! REST handlers / CLI ──write──► tasks.json
//!                                   │ notify (parent dir, filtered by name)
//!                                   ▼
//!                          ChangeWatcher::next_change()   (debounced)
//!                                   │
//!                                   ▼
//!                          TaskFile::load()  ── parse error ──► warn!, skip
//!                                   │ ok
//!                                   ▼
//!                          CollabHub::broadcast_tasks()  ──► tasksUpdated
//! ```
//!
//! The parent directory is watched rather than the file itself so that
//! editors and tools that replace the file through a rename are still seen.
//! Loading and parsing know nothing about fan-out; the hub treats the
//! snapshot as an opaque list.

use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{StoreError, WatchError};
use crate::hub::CollabHub;
use crate::shutdown::ShutdownSignal;

/// A continuous stream of writes is flushed after this many debounce windows.
const MAX_DEBOUNCE_WINDOWS: u32 = 10;

// ───────────────────────────────────────────────────────────────────
// Snapshot
// ───────────────────────────────────────────────────────────────────

/// The current task list, as opaque JSON values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskSnapshot {
    tasks: Vec<Value>,
}

impl TaskSnapshot {
    pub fn new(tasks: Vec<Value>) -> Self {
        Self { tasks }
    }

    /// Extract the task list from a parsed store document.
    ///
    /// Accepts a bare array or an object carrying a `tasks` array.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Array(tasks) => Some(Self { tasks }),
            Value::Object(mut map) => match map.remove("tasks") {
                Some(Value::Array(tasks)) => Some(Self { tasks }),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn tasks(&self) -> &[Value] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Read-only handle on the task store file.
#[derive(Debug, Clone)]
pub struct TaskFile {
    path: PathBuf,
}

impl TaskFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the current contents.
    pub async fn load(&self) -> Result<TaskSnapshot, StoreError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.parse(&bytes)
    }

    fn parse(&self, bytes: &[u8]) -> Result<TaskSnapshot, StoreError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })?;
        TaskSnapshot::from_value(value).ok_or_else(|| StoreError::InvalidFormat {
            path: self.path.clone(),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Change source
// ───────────────────────────────────────────────────────────────────

/// Debounced change notifications for one file.
pub struct ChangeWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<()>,
}

impl ChangeWatcher {
    /// Start watching `path`. The parent directory must exist.
    pub fn start(path: &Path) -> Result<Self, WatchError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| WatchError::InvalidPath(path.to_path_buf()))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &file_name) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => log::warn!("File watch error: {e}"),
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Wait for the next burst of changes.
    ///
    /// Resolves once no event has arrived for `debounce`, or after
    /// `MAX_DEBOUNCE_WINDOWS` windows of uninterrupted activity. Returns
    /// `None` when the underlying watcher has stopped.
    pub async fn next_change(&mut self, debounce: Duration) -> Option<()> {
        self.events.recv().await?;
        let deadline = Instant::now() + debounce * MAX_DEBOUNCE_WINDOWS;
        loop {
            let quiet = (Instant::now() + debounce).min(deadline);
            match tokio::time::timeout_at(quiet, self.events.recv()).await {
                Ok(Some(())) if Instant::now() < deadline => continue,
                _ => return Some(()),
            }
        }
    }
}

/// Writes, creations, renames and removals of the watched file. Plain reads
/// (including our own) are ignored.
fn is_relevant(event: &Event, file_name: &OsStr) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    kind_matches
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

/// Watch the task file until shutdown, broadcasting every successfully
/// parsed change.
pub async fn watch_task_file(
    file: TaskFile,
    hub: Arc<CollabHub>,
    debounce: Duration,
    mut shutdown: ShutdownSignal,
) -> Result<(), WatchError> {
    let mut watcher = ChangeWatcher::start(file.path())?;
    log::info!("Watching {} for external changes", file.path().display());

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            change = watcher.next_change(debounce) => {
                if change.is_none() {
                    log::warn!("File watcher for {} stopped", file.path().display());
                    break;
                }
                match file.load().await {
                    Ok(snapshot) => {
                        hub.broadcast_tasks(Arc::new(snapshot)).await;
                    }
                    Err(e) => log::warn!("Skipping task broadcast: {e}"),
                }
            }
        }
    }
    Ok(())
}
