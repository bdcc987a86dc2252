//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                           ┌── idle sweep (interval)
//!             ├── gateway ── CollabHub ──┤
//! Client B ──┘                 ▲          └── lock expiry timers
//!                              │
//!                 tasks.json ──┘ watch_task_file (notify)
//! ```
//!
//! The server owns the accept loop and the two background tasks. All of them
//! stop when the [`ShutdownCoordinator`] fires, after which the hub notifies
//! and closes every remaining connection.

use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::gateway::{handle_connection, run_idle_sweep};
use crate::hub::{CollabHub, ServerStats};
use crate::shutdown::ShutdownCoordinator;
use crate::watcher::{watch_task_file, TaskFile};

/// Real-time collaboration server.
pub struct CollabServer {
    hub: Arc<CollabHub>,
    shutdown: ShutdownCoordinator,
}

impl CollabServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: CollabHub::new(config),
            shutdown: ShutdownCoordinator::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    /// Handle for stopping the server from another task.
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.hub.config().bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let config = self.hub.config().clone();
        let tasks = TaskFile::new(&config.tasks_file);

        let sweep = tokio::spawn(run_idle_sweep(
            self.hub.clone(),
            config.sweep_interval,
            self.shutdown.subscribe(),
        ));

        let watcher = {
            let hub = self.hub.clone();
            let file = tasks.clone();
            let signal = self.shutdown.subscribe();
            tokio::spawn(async move {
                let path = file.path().display().to_string();
                if let Err(e) = watch_task_file(file, hub, config.watch_debounce, signal).await {
                    log::warn!("Not watching {path}: {e}");
                }
            })
        };

        let mut signal = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Transient (e.g. too many open files); keep accepting.
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    let tasks = tasks.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub, tasks).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        log::info!("Shutting down collaboration server");
        self.hub.shutdown().await;
        let _ = sweep.await;
        let _ = watcher.await;
        Ok(())
    }
}
