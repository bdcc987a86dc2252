//! Planboard collaboration server binary.
//!
//! Configuration comes from `COLLAB_*` environment variables; logging is
//! controlled with `RUST_LOG` (default `info`).

use log::{error, info};
use planboard_collab::{wait_for_os_signal, CollabServer, ServerConfig};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Starting Planboard collaboration server (max {} connections, watching {})",
        config.max_connections,
        config.tasks_file.display()
    );
    if config.auth_token.is_none() {
        info!("No COLLAB_AUTH_TOKEN set; accepting unauthenticated connections");
    }

    let server = CollabServer::new(config);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_os_signal().await;
        shutdown.trigger();
    });

    match server.run().await {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
