use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parley_core::ids::SessionId;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client, bound to one session for its lifetime.
pub struct Client {
    pub id: ClientId,
    pub session_id: SessionId,
    pub tx: mpsc::Sender<String>,
    pub connected: AtomicBool,
    pub last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, session_id: SessionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            session_id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        self.is_connected() && now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
    client_timeout: Duration,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize, client_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
            client_timeout,
        }
    }

    /// Register a client for `session_id` and return its id and outbound queue.
    pub fn register(&self, session_id: SessionId) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients
            .insert(id.clone(), Arc::new(Client::new(id.clone(), session_id, tx)));
        (id, rx)
    }

    /// Remove a client, returning the session it was bound to.
    pub fn unregister(&self, id: &ClientId) -> Option<SessionId> {
        let (_, client) = self.clients.remove(id)?;
        client.connected.store(false, Ordering::Relaxed);
        Some(client.session_id.clone())
    }

    pub fn session_of(&self, id: &ClientId) -> Option<SessionId> {
        self.clients.get(id).map(|c| c.session_id.clone())
    }

    /// Queue a frame for one client. A full queue drops the frame.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %client_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every client bound to `session_id`. Returns how many
    /// clients accepted it.
    pub fn broadcast_to_session(&self, session_id: &SessionId, message: &str) -> usize {
        let targets: Vec<Arc<Client>> = self
            .clients
            .iter()
            .filter(|c| &c.session_id == session_id && c.is_connected())
            .map(|c| Arc::clone(c.value()))
            .collect();
        let mut delivered = 0;
        for client in targets {
            match client.tx.try_send(message.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(client_id = %client.id, session_id = %session_id, "Send queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Queue a frame for every connected client. Returns how many accepted it.
    pub fn broadcast_all(&self, message: &str) -> usize {
        let targets: Vec<Arc<Client>> = self
            .clients
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| Arc::clone(c.value()))
            .collect();
        targets
            .into_iter()
            .filter(|client| client.tx.try_send(message.to_string()).is_ok())
            .count()
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients_for_session(&self, session_id: &SessionId) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|c| &c.session_id == session_id)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Remove clients that stopped answering pings. Returns the sessions they
    /// were bound to.
    pub fn cleanup_dead_clients(&self) -> Vec<SessionId> {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|c| !c.is_alive(self.client_timeout))
            .map(|c| c.id.clone())
            .collect();

        let mut sessions = Vec::new();
        for id in dead {
            if let Some(session_id) = self.unregister(&id) {
                tracing::info!(client_id = %id, session_id = %session_id, "Cleaned up dead client");
                sessions.push(session_id);
            }
        }
        sessions
    }

    fn mark_disconnected(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    fn record_pong(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }
}

/// Pump a WebSocket connection: outbound frames plus heartbeat pings on one
/// side, inbound text frames forwarded to `on_message` on the other. Returns
/// when either side closes. The caller unregisters the client.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    heartbeat: Duration,
    on_message: mpsc::Sender<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "Sent ping");
                }
            }
        }
        writer_registry.mark_disconnected(&writer_cid);
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send(text.to_string()).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    registry.mark_disconnected(&client_id);
}
