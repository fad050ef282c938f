use std::sync::Arc;

use parley_core::events::SessionEvent;
use tokio::sync::broadcast;

use crate::client::ClientRegistry;
use crate::protocol::ServerFrame;

/// Error kind sent to clients when the bridge fell behind and skipped events.
pub const EVENTS_DROPPED: &str = "events_dropped";

/// Forward every published session event to the clients bound to its
/// session, in the order the engine produced them. If the bridge lags, the
/// skipped events cannot be attributed to a session, so every client gets an
/// `events_dropped` error and should resync.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    mut rx: broadcast::Receiver<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(json) = serialize_event(&event) {
                        registry.broadcast_to_session(&event.session_id, &json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event bridge lagged, dropped events");
                    let frame = ServerFrame::error(EVENTS_DROPPED, format!("{n} session events were dropped; resync"));
                    if let Some(json) = frame.to_json() {
                        registry.broadcast_all(&json);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bridge channel closed");
                    break;
                }
            }
        }
    })
}

pub fn serialize_event(event: &SessionEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(session_id = %event.session_id, error = %e, "failed to serialize event");
            None
        }
    }
}
