//! Connection gateway: handshake, admission and the per-connection loop.
//!
//! ```text
//! TCP accept ──► WebSocket upgrade ──► Credentials (query + headers)
//!                                          │
//!                                  CollabHub::admit()
//!                          ┌───────────────┴───────────────┐
//!                      rejected                         admitted
//!               close 4401 / 1013 / 1001        snapshot ──► select! loop
//!                                                 inbound frames ──► hub
//!                                                 outbound queue ──► socket
//! ```

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::form_urlencoded;

use crate::error::AdmitError;
use crate::hub::{CollabHub, Credentials, EvictReason};
use crate::protocol::ClientEvent;
use crate::shutdown::ShutdownSignal;
use crate::watcher::TaskFile;

/// Close code for a failed token check.
pub const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Close frame telling a rejected client why.
pub fn rejection_frame(error: &AdmitError) -> CloseFrame {
    let code = match error {
        AdmitError::Unauthorized => CloseCode::Library(CLOSE_UNAUTHORIZED),
        AdmitError::AtCapacity { .. } => CloseCode::Again,
        AdmitError::ShuttingDown => CloseCode::Away,
    };
    CloseFrame {
        code,
        reason: error.to_string().into(),
    }
}

/// Extract credentials from the upgrade request.
///
/// The token comes from the `token` query parameter or an
/// `Authorization: Bearer` header; identity from `userId` / `userName`.
pub fn credentials_from_request(req: &Request, remote: SocketAddr) -> Credentials {
    let mut credentials = Credentials {
        remote_address: remote.to_string(),
        ..Credentials::default()
    };

    if let Some(query) = req.uri().query() {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "token" => credentials.token = Some(value.into_owned()),
                "userId" => credentials.user_id = Some(value.into_owned()),
                "userName" => credentials.user_name = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    if credentials.token.is_none() {
        credentials.token = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
    }
    credentials.user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    credentials
}

/// Handle a single WebSocket connection from upgrade to close.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<CollabHub>,
    tasks: TaskFile,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (cred_tx, cred_rx) = oneshot::channel();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = cred_tx.send(credentials_from_request(req, addr));
            Ok(resp)
        },
    )
    .await?;
    let credentials = cred_rx.await.unwrap_or_else(|_| Credentials {
        remote_address: addr.to_string(),
        ..Credentials::default()
    });
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let admission = match hub.admit(credentials).await {
        Ok(admission) => admission,
        Err(e) => {
            log::warn!("Rejected connection from {addr}: {e}");
            let _ = ws_sender.send(Message::Close(Some(rejection_frame(&e)))).await;
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };
    let connection_id = admission.connection_id;
    let mut outbound = admission.outbound;

    // Late joiners start from the current store contents.
    match tasks.load().await {
        Ok(snapshot) => {
            hub.send_tasks_to(connection_id, Arc::new(snapshot)).await;
        }
        Err(e) => log::debug!("No initial task snapshot for {connection_id}: {e}"),
    }

    let mut reason = EvictReason::ClientClosed;
    loop {
        tokio::select! {
            // Incoming WebSocket message
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        hub.heartbeat(connection_id).await;
                        match ClientEvent::decode(text.as_str()) {
                            Ok(event) => hub.handle_event(connection_id, event).await,
                            Err(e) => log::warn!("Ignoring frame from {connection_id}: {e}"),
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        hub.heartbeat(connection_id).await;
                        log::debug!("Ignoring binary frame from {connection_id}");
                    }
                    // tungstenite queues the pong reply itself.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        hub.heartbeat(connection_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("Connection {connection_id} closed by peer");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        reason = EvictReason::TransportError;
                        break;
                    }
                }
            }

            // Outgoing queued message
            out = outbound.recv() => {
                match out {
                    Some(frame) => {
                        let closing = frame.is_close();
                        if let Err(e) = ws_sender.send(frame).await {
                            log::debug!("Write to {connection_id} failed: {e}");
                            reason = EvictReason::TransportError;
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    // Sink dropped by the hub: we were evicted.
                    None => break,
                }
            }
        }
    }

    // No-op if the hub already evicted us.
    hub.evict(connection_id, reason).await;
    Ok(())
}

/// Periodically evict idle connections until shutdown.
pub async fn run_idle_sweep(hub: Arc<CollabHub>, interval: Duration, mut shutdown: ShutdownSignal) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let evicted = hub.sweep_idle(Instant::now()).await;
                if !evicted.is_empty() {
                    log::info!("Idle sweep evicted {} connections", evicted.len());
                }
            }
        }
    }
    log::debug!("Idle sweep stopped");
}
