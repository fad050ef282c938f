//! Per-connection frame handling.

use std::sync::Arc;

use parley_core::ids::SessionId;
use parley_engine::{EngineError, SessionHandle, SessionRegistry};
use tracing::{debug, warn};

use crate::client::{ClientId, ClientRegistry};
use crate::protocol::{ClientFrame, ControlFrame, ServerFrame, DEFAULT_LIST_LIMIT};

/// What a connection loop should do after a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The session was closed; the connection should end.
    Close,
}

/// Everything a frame handler needs for one connection.
pub struct Connection {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub sessions: Arc<SessionRegistry>,
    pub clients: Arc<ClientRegistry>,
}

impl Connection {
    fn reply(&self, frame: &ServerFrame) {
        if let Some(json) = frame.to_json() {
            self.clients.send_to(&self.client_id, json);
        }
    }

    fn reply_error(&self, err: &EngineError) {
        self.reply(&ServerFrame::from_engine_error(err));
    }

    /// The live actor for this connection's session, resuming it if it was
    /// evicted while the client sat idle.
    async fn session(&self) -> Result<SessionHandle, EngineError> {
        let (handle, _) = self.sessions.get_or_create(&self.session_id).await?;
        Ok(handle)
    }

    /// Send `session_started` and the session list.
    pub async fn greet(&self, handle: &SessionHandle, resumed: bool) -> Result<(), EngineError> {
        let snapshot = handle.snapshot().await?;
        self.reply(&ServerFrame::SessionStarted {
            session_id: self.session_id.clone(),
            resumed,
            state: snapshot.state,
            pending_tool_call: snapshot.pending_tool_call,
        });
        let sessions = self.sessions.list_sessions(DEFAULT_LIST_LIMIT, 0).await?;
        self.reply(&ServerFrame::ConversationHistory { sessions });
        Ok(())
    }

    /// Handle one inbound text frame. Session events are queued on the actor
    /// in arrival order; their outcome is reported asynchronously so the
    /// read loop never waits on a model turn.
    pub async fn handle_text(&self, text: &str) -> Flow {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client_id = %self.client_id, error = %e, "rejecting malformed frame");
                self.reply(&ServerFrame::error("invalid_message", e.to_string()));
                return Flow::Continue;
            }
        };

        match frame {
            ClientFrame::Event(event) => {
                let event_type = event.event_type();
                let pending = match self.session().await {
                    Ok(handle) => handle.submit(event).await,
                    Err(e) => Err(e),
                };
                match pending {
                    Ok(rx) => {
                        let clients = Arc::clone(&self.clients);
                        let client_id = self.client_id.clone();
                        tokio::spawn(async move {
                            let outcome = match rx.await {
                                Ok(outcome) => outcome,
                                Err(_) => return,
                            };
                            if let Err(e) = outcome {
                                debug!(client_id = %client_id, event_type, error = %e, "event rejected");
                                if let Some(json) = ServerFrame::from_engine_error(&e).to_json() {
                                    clients.send_to(&client_id, json);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(session_id = %self.session_id, event_type, error = %e, "could not queue event");
                        self.reply_error(&e);
                    }
                }
                Flow::Continue
            }
            ClientFrame::Control(ControlFrame::ListSessions { limit, offset }) => {
                match self
                    .sessions
                    .list_sessions(limit.unwrap_or(DEFAULT_LIST_LIMIT), offset.unwrap_or(0))
                    .await
                {
                    Ok(sessions) => self.reply(&ServerFrame::ConversationHistory { sessions }),
                    Err(e) => self.reply_error(&e),
                }
                Flow::Continue
            }
            ClientFrame::Control(ControlFrame::CloseSession) => match self.sessions.close(&self.session_id).await {
                Ok(()) => {
                    self.reply(&ServerFrame::SessionClosed {
                        session_id: self.session_id.clone(),
                    });
                    Flow::Close
                }
                Err(e) => {
                    self.reply_error(&e);
                    Flow::Continue
                }
            },
        }
    }
}
