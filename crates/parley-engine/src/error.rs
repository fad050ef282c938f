use parley_core::errors::ProviderError;
use parley_core::ids::{SessionId, ToolCallId};
use parley_core::ledger::LedgerError;
use parley_core::transcript::TranscriptError;
use parley_store::StoreError;

use crate::engine::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("confirmation for {call_id} does not match the pending tool call")]
    StaleConfirmation { call_id: ToolCallId },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("stream error: {0}")]
    Stream(ProviderError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {0} is no longer running")]
    SessionGone(SessionId),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Stable label used in outward error events and wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "invalid_state",
            Self::StaleConfirmation { .. } => "stale_confirmation",
            Self::Conflict(_) => "conflict",
            Self::Provider(e) => e.kind(),
            Self::Stream(_) => "stream_error",
            Self::Ledger(LedgerError::ConcurrentToolCall { .. }) => "concurrent_tool_call",
            Self::Ledger(_) => "ledger",
            Self::Transcript(_) => "transcript",
            Self::Store(_) => "persistence",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionGone(_) => "session_gone",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the session can keep going after this error was surfaced.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Ledger(LedgerError::ConcurrentToolCall { .. }) | Self::Transcript(_)
        )
    }
}
