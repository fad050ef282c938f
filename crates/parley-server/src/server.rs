use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use parley_core::ids::SessionId;
use parley_engine::SessionRegistry;

use crate::client::{self, ClientRegistry};
use crate::event_bridge;
use crate::handlers::{Connection, Flow};
use crate::protocol::{ServerFrame, DEFAULT_LIST_LIMIT};

/// Inbound frames buffered per connection before the read loop waits.
const INBOUND_QUEUE: usize = 64;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat: Duration,
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9091,
            max_send_queue: 256,
            heartbeat: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
        }
    }
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub heartbeat: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the server and its background tasks, and return a handle.
pub async fn start(config: ServerConfig, sessions: Arc<SessionRegistry>) -> Result<ServerHandle, std::io::Error> {
    let clients = Arc::new(ClientRegistry::new(config.max_send_queue, config.client_timeout));
    let shutdown = CancellationToken::new();

    let bridge = event_bridge::create_bridge(Arc::clone(&clients), sessions.subscribe());
    let cleanup = start_cleanup_task(
        Arc::clone(&clients),
        Arc::clone(&sessions),
        config.heartbeat,
        shutdown.clone(),
    );

    let router = build_router(AppState {
        sessions,
        clients,
        heartbeat: config.heartbeat,
    });
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "parley server started");

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        shutdown,
        server,
        bridge,
        cleanup,
    })
}

/// Keeps the server and its background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    bridge: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the listener to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        let _ = self.cleanup.await;
        self.bridge.abort();
        tracing::info!("parley server stopped");
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub session_id: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session_id = params
        .session_id
        .filter(|s| !s.is_empty())
        .map(SessionId::from_raw)
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, session_id: SessionId) {
    let (handle, resumed) = match state.sessions.get_or_create(&session_id).await {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "failed to open session");
            if let Some(json) = ServerFrame::from_engine_error(&e).to_json() {
                let _ = socket.send(WsMessage::Text(json.into())).await;
            }
            return;
        }
    };

    let (client_id, rx) = state.clients.register(session_id.clone());
    tracing::info!(client_id = %client_id, session_id = %session_id, resumed, "WebSocket client connected");

    let conn = Connection {
        client_id: client_id.clone(),
        session_id: session_id.clone(),
        sessions: Arc::clone(&state.sessions),
        clients: Arc::clone(&state.clients),
    };
    if let Err(e) = conn.greet(&handle, resumed).await {
        tracing::warn!(session_id = %session_id, error = %e, "failed to greet client");
    }

    let (in_tx, mut in_rx) = mpsc::channel::<String>(INBOUND_QUEUE);
    let pump = client::handle_ws_connection(
        socket,
        client_id.clone(),
        rx,
        Arc::clone(&state.clients),
        state.heartbeat,
        in_tx,
    );
    let dispatch = async {
        while let Some(text) = in_rx.recv().await {
            if conn.handle_text(&text).await == Flow::Close {
                state.clients.unregister(&conn.client_id);
                break;
            }
        }
    };
    tokio::join!(pump, dispatch);

    state.clients.unregister(&client_id);
    tracing::info!(client_id = %client_id, session_id = %session_id, "WebSocket client disconnected");
    release_if_orphaned(&state.clients, &state.sessions, &session_id).await;
}

/// Disconnect a session once its last client is gone.
async fn release_if_orphaned(clients: &ClientRegistry, sessions: &SessionRegistry, session_id: &SessionId) {
    if !clients.clients_for_session(session_id).is_empty() {
        return;
    }
    if let Err(e) = sessions.disconnect(session_id).await {
        tracing::warn!(session_id = %session_id, error = %e, "disconnect failed");
    }
}

fn start_cleanup_task(
    clients: Arc<ClientRegistry>,
    sessions: Arc<SessionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let orphaned = clients.cleanup_dead_clients();
                    if !orphaned.is_empty() {
                        tracing::info!(removed = orphaned.len(), "Dead client cleanup");
                    }
                    for session_id in orphaned {
                        release_if_orphaned(&clients, &sessions, &session_id).await;
                    }
                }
            }
        }
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "live_sessions": state.sessions.live_count(),
        "clients": state.clients.count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

async fn sessions_handler(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    match state
        .sessions
        .list_sessions(params.limit.unwrap_or(DEFAULT_LIST_LIMIT), params.offset.unwrap_or(0))
        .await
    {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "listing sessions failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ServerFrame::from_engine_error(&e))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::{SinkExt, StreamExt};
    use parley_engine::{EngineConfig, EngineDeps, ToolRegistry};
    use parley_llm::{MockProvider, MockResponse, RetryConfig, RetryingModelClient};
    use parley_store::{MemorySessionStore, SessionStore};
    use serde_json::{json, Value};
    use tokio::sync::broadcast;
    use tokio_tungstenite::tungstenite::Message;

    type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start_test_server(responses: Vec<MockResponse>) -> (ServerHandle, Arc<SessionRegistry>, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        let (events, _) = broadcast::channel(1024);
        let deps = EngineDeps {
            model: Arc::new(RetryingModelClient::new(
                MockProvider::new(responses),
                RetryConfig {
                    base_delay: Duration::from_millis(1),
                    jitter_factor: 0.0,
                    ..Default::default()
                },
            )),
            tools: Arc::new(ToolRegistry::new()),
            store: store.clone(),
            events,
            config: Arc::new(EngineConfig::default()),
        };
        let sessions = Arc::new(SessionRegistry::new(deps));
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, Arc::clone(&sessions)).await.unwrap();
        (handle, sessions, store)
    }

    async fn connect(port: u16, session_id: Option<&str>) -> Ws {
        let url = match session_id {
            Some(id) => format!("ws://127.0.0.1:{port}/ws?session_id={id}"),
            None => format!("ws://127.0.0.1:{port}/ws"),
        };
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    async fn next_json(ws: &mut Ws) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn next_of_type(ws: &mut Ws, kind: &str) -> Value {
        loop {
            let frame = next_json(ws).await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    async fn send(ws: &mut Ws, frame: Value) {
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    #[tokio::test]
    async fn health_and_sessions_endpoints() {
        let (handle, sessions, _) = start_test_server(vec![]).await;
        sessions.create().await.unwrap();

        let base = format!("http://127.0.0.1:{}", handle.port);
        let health: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["live_sessions"], 1);

        let list: Value = reqwest::get(format!("{base}/sessions?limit=5")).await.unwrap().json().await.unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn conversation_over_websocket() {
        let (handle, _, _) = start_test_server(vec![MockResponse::text("Hello there")]).await;
        let mut ws = connect(handle.port, None).await;

        let started = next_json(&mut ws).await;
        assert_eq!(started["type"], "session_started");
        assert_eq!(started["resumed"], false);
        assert_eq!(started["state"], "idle");
        let history = next_json(&mut ws).await;
        assert_eq!(history["type"], "conversation_history");

        send(&mut ws, json!({"type": "user_message", "text": "hi"})).await;
        let chunk = next_json(&mut ws).await;
        assert_eq!(chunk["type"], "message_chunk");
        assert_eq!(chunk["chunk"], "Hello there");
        assert_eq!(chunk["seq"], 0);
        let complete = next_json(&mut ws).await;
        assert_eq!(complete["type"], "message_complete");
        assert_eq!(complete["content"], "Hello there");
        let usage = next_json(&mut ws).await;
        assert_eq!(usage["type"], "token_usage_update");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bad_frames_get_error_replies() {
        let (handle, _, _) = start_test_server(vec![]).await;
        let mut ws = connect(handle.port, None).await;
        next_of_type(&mut ws, "conversation_history").await;

        send(&mut ws, json!({"type": "dance"})).await;
        let err = next_json(&mut ws).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["kind"], "invalid_message");
        assert_eq!(err["recoverable"], true);

        send(&mut ws, json!({"type": "tool_confirm", "call_id": "toolu_1", "confirmed": true})).await;
        let err = next_json(&mut ws).await;
        assert_eq!(err["kind"], "invalid_state");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_resumes_pending_confirmation() {
        let (handle, sessions, _) = start_test_server(vec![MockResponse::tool_use(
            "toolu_1",
            "bash",
            json!({"command": "ls"}),
        )])
        .await;
        let mut ws = connect(handle.port, None).await;
        let started = next_json(&mut ws).await;
        let session_id = started["session_id"].as_str().unwrap().to_string();

        send(&mut ws, json!({"type": "user_message", "text": "list files"})).await;
        let request = next_of_type(&mut ws, "tool_confirmation_requested").await;
        assert_eq!(request["call_id"], "toolu_1");
        assert_eq!(request["code"], "ls");

        ws.close(None).await.unwrap();
        let sid = SessionId::from_raw(session_id.clone());
        for _ in 0..50 {
            if !sessions.is_live(&sid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!sessions.is_live(&sid));

        let mut ws = connect(handle.port, Some(&session_id)).await;
        let started = next_json(&mut ws).await;
        assert_eq!(started["resumed"], true);
        assert_eq!(started["state"], "awaiting_confirmation");
        assert_eq!(started["pending_tool_call"]["call_id"], "toolu_1");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn close_session_terminates() {
        let (handle, sessions, store) = start_test_server(vec![]).await;
        let mut ws = connect(handle.port, None).await;
        let started = next_json(&mut ws).await;
        let sid = SessionId::from_raw(started["session_id"].as_str().unwrap());

        send(&mut ws, json!({"type": "close_session"})).await;
        let closed = next_of_type(&mut ws, "session_closed").await;
        assert_eq!(closed["session_id"], sid.as_str());
        assert!(!sessions.is_live(&sid));
        assert!(store.load(&sid).await.unwrap().is_some());
        handle.shutdown().await;
    }
}
