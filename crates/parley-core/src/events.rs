use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId};
use crate::record::ConversationSnapshot;
use crate::tokens::{TokenAccount, TokenUsage};
use crate::tools::Artifact;
use crate::transcript::{Attachment, StopReason};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Content,
    Thinking,
}

/// Events a session publishes to the transport, in production order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutwardEvent {
    #[serde(rename = "message_chunk")]
    MessageChunk { chunk: String, stream_type: StreamType },

    #[serde(rename = "message_complete")]
    MessageComplete {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
    },

    #[serde(rename = "tool_execution_start")]
    ToolExecutionStart {
        call_id: ToolCallId,
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    #[serde(rename = "tool_execution_result")]
    ToolExecutionResult {
        call_id: ToolCallId,
        tool_name: String,
        result: String,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<Artifact>,
    },

    #[serde(rename = "tool_confirmation_requested")]
    ToolConfirmationRequested {
        call_id: ToolCallId,
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    #[serde(rename = "token_usage_update")]
    TokenUsageUpdate {
        input_tokens: u64,
        output_tokens: u64,
        total_input_tokens: u64,
        total_output_tokens: u64,
        total_tokens: u64,
    },

    #[serde(rename = "error")]
    Error {
        kind: String,
        message: String,
        recoverable: bool,
    },

    #[serde(rename = "system_notice")]
    SystemNotice { message: String },

    #[serde(rename = "auto_confirm_state")]
    AutoConfirmState { enabled: bool },

    #[serde(rename = "conversation_loaded")]
    ConversationLoaded { turn_count: usize },
}

impl OutwardEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageChunk { .. } => "message_chunk",
            Self::MessageComplete { .. } => "message_complete",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionResult { .. } => "tool_execution_result",
            Self::ToolConfirmationRequested { .. } => "tool_confirmation_requested",
            Self::TokenUsageUpdate { .. } => "token_usage_update",
            Self::Error { .. } => "error",
            Self::SystemNotice { .. } => "system_notice",
            Self::AutoConfirmState { .. } => "auto_confirm_state",
            Self::ConversationLoaded { .. } => "conversation_loaded",
        }
    }

    pub fn token_usage(turn: &TokenUsage, account: &TokenAccount) -> Self {
        Self::TokenUsageUpdate {
            input_tokens: turn.total_input(),
            output_tokens: u64::from(turn.output_tokens),
            total_input_tokens: account.input_tokens,
            total_output_tokens: account.output_tokens,
            total_tokens: account.total(),
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error {
            kind: kind.into(),
            message: message.into(),
            recoverable,
        }
    }
}

/// An outward event stamped with its session and per-session sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OutwardEvent,
}

/// Events the transport delivers to a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InwardEvent {
    #[serde(rename = "user_message")]
    UserMessage {
        text: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },

    #[serde(rename = "tool_confirm")]
    ToolConfirm {
        call_id: ToolCallId,
        confirmed: bool,
        #[serde(default)]
        rejection_reason: Option<String>,
    },

    #[serde(rename = "load_conversation")]
    LoadConversation { snapshot: ConversationSnapshot },

    #[serde(rename = "update_auto_confirm")]
    UpdateAutoConfirm { enabled: bool },

    #[serde(rename = "get_auto_confirm_state")]
    GetAutoConfirmState,
}

impl InwardEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::UserMessage { .. } => "user_message",
            Self::ToolConfirm { .. } => "tool_confirm",
            Self::LoadConversation { .. } => "load_conversation",
            Self::UpdateAutoConfirm { .. } => "update_auto_confirm",
            Self::GetAutoConfirmState => "get_auto_confirm_state",
        }
    }
}
