//! Frames exchanged over the WebSocket besides the session events
//! themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_core::events::InwardEvent;
use parley_core::ids::SessionId;
use parley_core::ledger::LedgerEntry;
use parley_core::record::SessionSummary;
use parley_engine::{EngineError, SessionState};

pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Connection-level requests that are not session events.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    ListSessions {
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        offset: Option<u32>,
    },
    CloseSession,
}

/// A decoded inbound text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    Control(ControlFrame),
    Event(InwardEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingType)?
            .to_owned();
        match kind.as_str() {
            "list_sessions" | "close_session" => Ok(Self::Control(serde_json::from_value(value)?)),
            "user_message" | "tool_confirm" | "load_conversation" | "update_auto_confirm"
            | "get_auto_confirm_state" => Ok(Self::Event(serde_json::from_value(value)?)),
            _ => Err(FrameError::UnknownType(kind)),
        }
    }
}

/// Server-originated frames.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    SessionStarted {
        session_id: SessionId,
        resumed: bool,
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_tool_call: Option<LedgerEntry>,
    },
    ConversationHistory {
        sessions: Vec<SessionSummary>,
    },
    SessionClosed {
        session_id: SessionId,
    },
    Error {
        kind: String,
        message: String,
        recoverable: bool,
    },
}

impl ServerFrame {
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn from_engine_error(err: &EngineError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
