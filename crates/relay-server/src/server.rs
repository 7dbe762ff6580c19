use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relay_engine::{start_parked_sweeper, SessionCoordinator};

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 22041,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events/{session_id}", get(handlers::events))
        .route("/chat", post(handlers::chat))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{session_id}", delete(handlers::delete_session))
        .route("/sessions/{session_id}/messages", get(handlers::session_messages))
        .route("/sessions/{session_id}/process/advance", post(handlers::advance_process))
        .route("/sessions/{session_id}/stream", delete(handlers::detach_stream))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    coordinator: Arc<SessionCoordinator>,
) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState {
        coordinator: Arc::clone(&coordinator),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "relay server started");

    let shutdown = CancellationToken::new();
    start_parked_sweeper(coordinator, shutdown.child_token());
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait up to `grace` for open ones.
    /// Event streams never end on their own, so they are cut after `grace`.
    pub async fn shutdown(self, grace: Duration) {
        self.shutdown.cancel();
        let mut server = self.server;
        if tokio::time::timeout(grace, &mut server).await.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "forcing server shutdown");
            server.abort();
        }
        tracing::info!("relay server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relay_engine::{EngineConfig, FixedJobSizer};
    use relay_store::{Database, SqliteHistoryStore};
    use serde_json::Value;

    fn coordinator(responses: u32) -> Arc<SessionCoordinator> {
        let history = Arc::new(SqliteHistoryStore::new(Database::in_memory().unwrap()));
        let config = EngineConfig {
            pacing_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(100),
            push_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        Arc::new(
            SessionCoordinator::new(config, history)
                .with_job_sizer(Arc::new(FixedJobSizer(responses))),
        )
    }

    async fn spawn(responses: u32) -> (ServerHandle, Arc<SessionCoordinator>, String) {
        let coord = coordinator(responses);
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0, // Random port
        };
        let handle = start(config, Arc::clone(&coord)).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        (handle, coord, base)
    }

    /// Read SSE frames until `count` events of type `kind` have been seen.
    async fn collect_events(resp: reqwest::Response, kind: &str, count: usize) -> Vec<Value> {
        let mut body = resp.bytes_stream();
        let mut buffer = String::new();
        let mut found = Vec::new();
        let marker = format!("event: {kind}\n");
        while found.len() < count {
            let chunk = tokio::time::timeout(Duration::from_secs(3), body.next())
                .await
                .expect("sse timed out")
                .expect("sse ended")
                .unwrap();
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                if frame.contains(&marker) {
                    let data = frame
                        .lines()
                        .find_map(|l| l.strip_prefix("data: "))
                        .unwrap();
                    found.push(serde_json::from_str(data).unwrap());
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handle, _coord, base) = spawn(1).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeConnections"], 0);

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn chat_returns_receipt_and_streams_responses() {
        let (handle, _coord, base) = spawn(3).await;
        let client = reqwest::Client::new();

        let first: Value = client
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({"message": "hello", "userId": "u1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["success"], true);
        assert_eq!(first["type"], "chat_started");
        assert_eq!(first["messageCount"], 1);
        assert_eq!(first["totalResponses"], 3);
        assert_eq!(first["processStatus"], "TOPIC");
        let sid = first["sessionId"].as_str().unwrap().to_string();
        // Let the first job drain into the parked channel.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stream = client.get(format!("{base}/events/{sid}")).send().await.unwrap();
        assert_eq!(stream.status(), 200);
        assert!(stream.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let second: Value = client
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({"sessionId": sid, "message": "again"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["sessionId"], sid.as_str());
        assert_eq!(second["messageCount"], 2);

        let messages = collect_events(stream, "message", 3).await;
        for (i, m) in messages.iter().enumerate() {
            assert_eq!(m["type"], "chat_response");
            assert_eq!(m["sequence"], i as u64 + 1);
            assert_eq!(m["total"], 3);
            assert_eq!(m["originalMessage"], "again");
        }

        handle.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn stream_starts_with_connected_then_heartbeat() {
        let (handle, _coord, base) = spawn(1).await;
        let resp = reqwest::get(format!("{base}/events/idle-session")).await.unwrap();

        let mut body = resp.bytes_stream();
        let mut text = String::new();
        while !text.contains("event: heartbeat") {
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        let connected = text.find("event: connected").unwrap();
        assert!(connected < text.find("event: heartbeat").unwrap());
        assert!(text.contains("\"sessionId\":\"idle-session\""));

        handle.shutdown(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn missing_message_is_bad_request() {
        let (handle, coord, base) = spawn(1).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({"sessionId": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "malformed_request");

        let resp = client
            .post(format!("{base}/chat"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        assert_eq!(coord.session_count(), 0);

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn history_delete_and_process_routes() {
        let (handle, _coord, base) = spawn(2).await;
        let client = reqwest::Client::new();

        let receipt: Value = client
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({"message": "build it"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let sid = receipt["sessionId"].as_str().unwrap().to_string();

        // No stream yet: the session holds a parked channel only.
        let health: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["activeConnections"], 0);
        assert_eq!(health["parkedChannels"], 1);

        let advanced: Value = client
            .post(format!("{base}/sessions/{sid}/process/advance"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(advanced["processStatus"], "DATA");

        let missing = client
            .post(format!("{base}/sessions/nope/process/advance"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let history: Value = client
            .get(format!("{base}/sessions/{sid}/messages"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let messages = history["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["type"], "user");
        assert_eq!(messages[0]["content"], "build it");

        let listed: Value = reqwest::get(format!("{base}/sessions"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed["total"], 1);
        assert_eq!(listed["sessions"][0]["processStatus"], "DATA");

        let deleted = client.delete(format!("{base}/sessions/{sid}")).send().await.unwrap();
        assert_eq!(deleted.status(), 200);
        let history: Value = client
            .get(format!("{base}/sessions/{sid}/messages"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(history["messages"].as_array().unwrap().is_empty());

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn detach_route_ends_stream() {
        let (handle, coord, base) = spawn(1).await;
        let client = reqwest::Client::new();
        let resp = client.get(format!("{base}/events/to-detach")).send().await.unwrap();
        let mut body = resp.bytes_stream();
        let first = body.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("event: connected"));

        let detached: Value = client
            .delete(format!("{base}/sessions/to-detach/stream"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detached["detached"], true);

        let end = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(chunk) = body.next().await {
                if chunk.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(end.is_ok());
        assert_eq!(coord.registry().count(), 0);

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState {
            coordinator: coordinator(1),
        };
        let _router = build_router(state);
        // If this doesn't panic, the router was built successfully
    }
}
