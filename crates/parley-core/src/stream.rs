use crate::errors::ProviderError;
use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;
use crate::transcript::{AssistantTurn, StopReason, ToolCallSegment};

/// Provider-native incremental output, one variant per wire-level delta.
/// Content blocks are addressed by their provider index.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderDelta {
    MessageStart { usage: TokenUsage },
    TextDelta { index: usize, text: String },
    ThinkingDelta { index: usize, text: String },
    SignatureDelta { index: usize, signature: String },
    ToolCallStart { index: usize, call_id: ToolCallId, tool_name: String },
    ToolArgsDelta { index: usize, partial_json: String },
    BlockStop { index: usize },
    MessageDelta { stop_reason: Option<StopReason>, output_tokens: Option<u32> },
    MessageStop,
    Error { error: ProviderError },
}

impl ProviderDelta {
    /// Deltas that carry user-visible content. Once one of these has been
    /// observed, a failure can no longer be retried transparently.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. }
                | Self::ThinkingDelta { .. }
                | Self::ToolCallStart { .. }
                | Self::ToolArgsDelta { .. }
        )
    }
}

/// Assembled, ordered model output for one turn. Single pass; after
/// `TurnComplete` or `StreamError` the sequence ends.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta { text: String },
    ThinkingDelta { text: String },
    ToolCallAnnounced { call_id: ToolCallId, tool_name: String },
    ToolCallArgsComplete { call: ToolCallSegment },
    TurnComplete { turn: AssistantTurn },
    StreamError { error: ProviderError },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::StreamError { .. })
    }
}
