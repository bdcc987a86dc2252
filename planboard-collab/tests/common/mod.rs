//! Shared helpers for the end-to-end tests: a server on a free port with its
//! own task file, and a thin JSON client over raw WebSockets.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use planboard_collab::{CollabServer, ServerConfig};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub url: String,
    pub server: Arc<CollabServer>,
    dir: TempDir,
}

impl TestServer {
    pub fn tasks_path(&self) -> PathBuf {
        self.dir.path().join("tasks.json")
    }
}

/// Start a server on a free port. `initial_tasks`, if given, is written to
/// the task file before the server starts.
pub async fn start_test_server(mut config: ServerConfig, initial_tasks: Option<&Value>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    config.tasks_file = dir.path().join("tasks.json");
    if let Some(tasks) = initial_tasks {
        std::fs::write(&config.tasks_file, serde_json::to_vec(tasks).unwrap()).unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(CollabServer::new(config));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    // Give the watcher time to arm
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestServer {
        url: format!("ws://127.0.0.1:{port}"),
        server,
        dir,
    }
}

/// Open a raw connection with the given query string.
pub async fn connect(url: &str, query: &str) -> Client {
    let (ws, _) = connect_async(format!("{url}/?{query}")).await.unwrap();
    ws
}

/// Connect as `name` and consume the `connected` event.
pub async fn connect_as(server: &TestServer, name: &str) -> (Client, Value) {
    let mut ws = connect(&server.url, &format!("userId=u-{name}&userName={name}")).await;
    let connected = expect_event(&mut ws, "connected").await;
    assert_eq!(connected["data"]["userName"], name);
    (ws, connected)
}

/// Next application event. Pings and pongs are skipped; a close frame comes
/// back as `{"event": "__close", "code": <u16>}`.
pub async fn next_event(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for an event")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code)).unwrap_or(0);
                return json!({"event": "__close", "code": code});
            }
            _ => continue,
        }
    }
}

/// Skip events until one named `name` arrives.
pub async fn expect_event(ws: &mut Client, name: &str) -> Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] == name {
            return event;
        }
        assert_ne!(event["event"], "__close", "closed while waiting for {name}");
    }
}

/// Assert that no application event arrives within `wait`.
pub async fn assert_quiet(ws: &mut Client, wait: Duration) {
    if let Ok(event) = timeout(wait, next_event(ws)).await {
        panic!("unexpected event {event}");
    }
}

pub async fn send_event(ws: &mut Client, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

pub fn lock_request(lock_id: &str, extend: bool) -> Value {
    json!({
        "lockId": lock_id,
        "resourceType": "task",
        "resourceId": 1,
        "field": "title",
        "timeoutMs": 30_000,
        "extend": extend,
    })
}
