use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;
use crate::tools::Artifact;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Turn {
    #[serde(rename = "user")]
    User(UserTurn),
    #[serde(rename = "assistant")]
    Assistant(AssistantTurn),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultTurn),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserTurn {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// A text file the user attached to a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub segments: Vec<Segment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultTurn {
    pub call_id: ToolCallId,
    pub tool_name: String,
    pub content: String,
    pub outcome: ResultOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl ResultOutcome {
    pub fn is_error(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Segment {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCallSegment),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSegment {
    pub call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Refusal,
}

impl StopReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_turn" => Some(Self::EndTurn),
            "tool_use" => Some(Self::ToolUse),
            "max_tokens" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            "refusal" => Some(Self::Refusal),
            _ => None,
        }
    }
}

// --- Convenience constructors ---

impl UserTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Message text with attachments inlined the way the model sees them.
    pub fn rendered_text(&self) -> String {
        let mut out = self.text.clone();
        for a in &self.attachments {
            out.push_str(&format!(
                "\n\n--- File: {name} ---\n{content}\n--- End of {name} ---",
                name = a.name,
                content = a.content
            ));
        }
        out
    }
}

impl AssistantTurn {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            stop_reason: None,
            usage: TokenUsage::default(),
            created_at: Utc::now(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        let mut turn = Self::new(vec![Segment::Text { text: text.into() }]);
        turn.stop_reason = Some(StopReason::EndTurn);
        turn
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallSegment> {
        self.segments.iter().filter_map(|s| match s {
            Segment::ToolCall(tc) => Some(tc),
            _ => None,
        })
    }

    /// Concatenated visible text, excluding thinking.
    pub fn visible_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl ToolResultTurn {
    pub fn new(
        call_id: ToolCallId,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        outcome: ResultOutcome,
    ) -> Self {
        Self {
            call_id,
            tool_name: tool_name.into(),
            content: content.into(),
            outcome,
            artifacts: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    #[error("tool call {call_id} has no result yet")]
    UnresolvedToolCall { call_id: ToolCallId },
    #[error("no unresolved tool call with id {call_id}")]
    UnknownToolCall { call_id: ToolCallId },
    #[error("tool call {call_id} already has a result")]
    DuplicateToolResult { call_id: ToolCallId },
    #[error("tool call id {call_id} appears more than once")]
    DuplicateToolCall { call_id: ToolCallId },
    #[error("transcript ends with {count} unresolved tool calls; at most one is allowed")]
    MultipleUnresolved { count: usize },
}

/// Ordered, append-only conversation record.
///
/// Every tool call must receive exactly one result before the next user or
/// assistant turn. The only state in which a call may stay open is at the
/// tail, while it waits for confirmation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Turn>", into = "Vec<Turn>")]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transcript from stored turns, checking the pairing rules.
    pub fn from_turns(turns: Vec<Turn>) -> Result<Self, TranscriptError> {
        validate(&turns)?;
        Ok(Self { turns })
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn push_user(&mut self, turn: UserTurn) -> Result<(), TranscriptError> {
        self.ensure_resolved()?;
        self.turns.push(Turn::User(turn));
        Ok(())
    }

    pub fn push_assistant(&mut self, turn: AssistantTurn) -> Result<(), TranscriptError> {
        self.ensure_resolved()?;
        let mut fresh = HashSet::new();
        for call in turn.tool_calls() {
            if !fresh.insert(&call.call_id) || self.contains_call(&call.call_id) {
                return Err(TranscriptError::DuplicateToolCall {
                    call_id: call.call_id.clone(),
                });
            }
        }
        self.turns.push(Turn::Assistant(turn));
        Ok(())
    }

    pub fn push_tool_result(&mut self, turn: ToolResultTurn) -> Result<(), TranscriptError> {
        if !self.unresolved_calls().iter().any(|c| c.call_id == turn.call_id) {
            let already = self
                .turns
                .iter()
                .any(|t| matches!(t, Turn::ToolResult(r) if r.call_id == turn.call_id));
            return Err(if already {
                TranscriptError::DuplicateToolResult { call_id: turn.call_id }
            } else {
                TranscriptError::UnknownToolCall { call_id: turn.call_id }
            });
        }
        self.turns.push(Turn::ToolResult(turn));
        Ok(())
    }

    /// Tool calls of the latest assistant turn that have no result yet.
    pub fn unresolved_calls(&self) -> Vec<&ToolCallSegment> {
        let Some(idx) = self.turns.iter().rposition(|t| matches!(t, Turn::Assistant(_))) else {
            return Vec::new();
        };
        let Turn::Assistant(assistant) = &self.turns[idx] else {
            return Vec::new();
        };
        let resolved: HashSet<&ToolCallId> = self.turns[idx + 1..]
            .iter()
            .filter_map(|t| match t {
                Turn::ToolResult(r) => Some(&r.call_id),
                _ => None,
            })
            .collect();
        assistant
            .tool_calls()
            .filter(|c| !resolved.contains(&c.call_id))
            .collect()
    }

    /// True when the transcript can be sent to the model as-is: non-empty,
    /// fully paired, and not ending on an assistant turn.
    pub fn ready_for_model(&self) -> bool {
        self.unresolved_calls().is_empty()
            && matches!(self.turns.last(), Some(Turn::User(_) | Turn::ToolResult(_)))
    }

    pub fn last_assistant(&self) -> Option<&AssistantTurn> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::Assistant(a) => Some(a),
            _ => None,
        })
    }

    /// First user message, shortened for listings.
    pub fn title(&self, max_chars: usize) -> Option<String> {
        self.turns.iter().find_map(|t| match t {
            Turn::User(u) => {
                let line = u.text.lines().next().unwrap_or_default().trim();
                Some(line.chars().take(max_chars).collect())
            }
            _ => None,
        })
    }

    fn ensure_resolved(&self) -> Result<(), TranscriptError> {
        match self.unresolved_calls().first() {
            Some(call) => Err(TranscriptError::UnresolvedToolCall {
                call_id: call.call_id.clone(),
            }),
            None => Ok(()),
        }
    }

    fn contains_call(&self, call_id: &ToolCallId) -> bool {
        self.turns.iter().any(|t| match t {
            Turn::Assistant(a) => a.tool_calls().any(|c| &c.call_id == call_id),
            _ => false,
        })
    }
}

fn validate(turns: &[Turn]) -> Result<(), TranscriptError> {
    let mut open: Vec<&ToolCallId> = Vec::new();
    let mut seen: HashSet<&ToolCallId> = HashSet::new();
    let mut resolved: HashSet<&ToolCallId> = HashSet::new();

    for turn in turns {
        match turn {
            Turn::User(_) | Turn::Assistant(_) if !open.is_empty() => {
                return Err(TranscriptError::UnresolvedToolCall {
                    call_id: open[0].clone(),
                });
            }
            Turn::User(_) => {}
            Turn::Assistant(a) => {
                for call in a.tool_calls() {
                    if !seen.insert(&call.call_id) {
                        return Err(TranscriptError::DuplicateToolCall {
                            call_id: call.call_id.clone(),
                        });
                    }
                    open.push(&call.call_id);
                }
            }
            Turn::ToolResult(r) => {
                if let Some(pos) = open.iter().position(|id| **id == r.call_id) {
                    open.remove(pos);
                    resolved.insert(&r.call_id);
                } else if resolved.contains(&r.call_id) {
                    return Err(TranscriptError::DuplicateToolResult {
                        call_id: r.call_id.clone(),
                    });
                } else {
                    return Err(TranscriptError::UnknownToolCall {
                        call_id: r.call_id.clone(),
                    });
                }
            }
        }
    }

    if open.len() > 1 {
        return Err(TranscriptError::MultipleUnresolved { count: open.len() });
    }
    Ok(())
}

impl TryFrom<Vec<Turn>> for Transcript {
    type Error = TranscriptError;

    fn try_from(turns: Vec<Turn>) -> Result<Self, Self::Error> {
        Self::from_turns(turns)
    }
}

impl From<Transcript> for Vec<Turn> {
    fn from(t: Transcript) -> Self {
        t.turns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCallSegment {
        ToolCallSegment {
            call_id: ToolCallId::from_raw(id),
            tool_name: "bash".into(),
            arguments: json!({"command": "ls"}),
        }
    }

    fn calling(ids: &[&str]) -> AssistantTurn {
        let mut turn = AssistantTurn::new(ids.iter().map(|id| Segment::ToolCall(call(id))).collect());
        turn.stop_reason = Some(StopReason::ToolUse);
        turn
    }

    fn result(id: &str) -> ToolResultTurn {
        ToolResultTurn::new(ToolCallId::from_raw(id), "bash", "ok", ResultOutcome::Completed)
    }

    #[test]
    fn plain_conversation() {
        let mut t = Transcript::new();
        assert!(!t.ready_for_model());
        t.push_user(UserTurn::new("hi")).unwrap();
        assert!(t.ready_for_model());
        t.push_assistant(AssistantTurn::text("hello")).unwrap();
        assert!(!t.ready_for_model());
        t.push_user(UserTurn::new("again")).unwrap();
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn user_turn_blocked_by_open_call() {
        let mut t = Transcript::new();
        t.push_user(UserTurn::new("list files")).unwrap();
        t.push_assistant(calling(&["c1"])).unwrap();
        let err = t.push_user(UserTurn::new("hello?")).unwrap_err();
        assert_eq!(
            err,
            TranscriptError::UnresolvedToolCall { call_id: ToolCallId::from_raw("c1") }
        );
        let err = t.push_assistant(AssistantTurn::text("x")).unwrap_err();
        assert!(matches!(err, TranscriptError::UnresolvedToolCall { .. }));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn results_pair_with_calls() {
        let mut t = Transcript::new();
        t.push_user(UserTurn::new("go")).unwrap();
        t.push_assistant(calling(&["c1"])).unwrap();
        assert_eq!(t.unresolved_calls().len(), 1);
        t.push_tool_result(result("c1")).unwrap();
        assert!(t.unresolved_calls().is_empty());
        assert!(t.ready_for_model());

        assert_eq!(
            t.push_tool_result(result("c1")).unwrap_err(),
            TranscriptError::DuplicateToolResult { call_id: ToolCallId::from_raw("c1") }
        );
        assert_eq!(
            t.push_tool_result(result("nope")).unwrap_err(),
            TranscriptError::UnknownToolCall { call_id: ToolCallId::from_raw("nope") }
        );
    }

    #[test]
    fn reused_call_id_is_rejected() {
        let mut t = Transcript::new();
        t.push_user(UserTurn::new("go")).unwrap();
        t.push_assistant(calling(&["c1"])).unwrap();
        t.push_tool_result(result("c1")).unwrap();
        assert!(matches!(
            t.push_assistant(calling(&["c1"])),
            Err(TranscriptError::DuplicateToolCall { .. })
        ));
        assert!(matches!(
            t.push_assistant(calling(&["c2", "c2"])),
            Err(TranscriptError::DuplicateToolCall { .. })
        ));
    }

    #[test]
    fn from_turns_allows_single_trailing_call() {
        let turns = vec![Turn::User(UserTurn::new("go")), Turn::Assistant(calling(&["c1"]))];
        let t = Transcript::from_turns(turns).unwrap();
        assert_eq!(t.unresolved_calls()[0].call_id.as_str(), "c1");
    }

    #[test]
    fn from_turns_allows_trailing_call_with_sibling_resolved() {
        let turns = vec![
            Turn::User(UserTurn::new("go")),
            Turn::Assistant(calling(&["c1", "c2"])),
            Turn::ToolResult(result("c2")),
        ];
        let t = Transcript::from_turns(turns).unwrap();
        assert_eq!(t.unresolved_calls().len(), 1);
    }

    #[test]
    fn from_turns_rejects_violations() {
        let two_open = vec![Turn::User(UserTurn::new("go")), Turn::Assistant(calling(&["a", "b"]))];
        assert_eq!(
            Transcript::from_turns(two_open).unwrap_err(),
            TranscriptError::MultipleUnresolved { count: 2 }
        );

        let orphan = vec![
            Turn::User(UserTurn::new("go")),
            Turn::Assistant(calling(&["a"])),
            Turn::User(UserTurn::new("?")),
        ];
        assert!(matches!(
            Transcript::from_turns(orphan),
            Err(TranscriptError::UnresolvedToolCall { .. })
        ));

        let stray = vec![Turn::User(UserTurn::new("go")), Turn::ToolResult(result("x"))];
        assert!(matches!(
            Transcript::from_turns(stray),
            Err(TranscriptError::UnknownToolCall { .. })
        ));
    }

    #[test]
    fn deserialize_validates() {
        let json = json!([
            {"role": "user", "text": "go", "created_at": "2025-01-01T00:00:00Z"},
            {"role": "tool_result", "call_id": "x", "tool_name": "bash", "content": "",
             "outcome": "completed", "created_at": "2025-01-01T00:00:00Z"}
        ]);
        assert!(serde_json::from_value::<Transcript>(json).is_err());
    }

    #[test]
    fn serde_roundtrip_preserves_turns() {
        let mut t = Transcript::new();
        t.push_user(UserTurn::new("go")).unwrap();
        t.push_assistant(calling(&["c1"])).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn attachments_are_inlined() {
        let turn = UserTurn::new("check this").with_attachments(vec![Attachment {
            name: "notes.txt".into(),
            content: "alpha".into(),
        }]);
        assert_eq!(
            turn.rendered_text(),
            "check this\n\n--- File: notes.txt ---\nalpha\n--- End of notes.txt ---"
        );
    }

    #[test]
    fn title_uses_first_user_line() {
        let mut t = Transcript::new();
        assert_eq!(t.title(10), None);
        t.push_user(UserTurn::new("list all the files here\nplease")).unwrap();
        assert_eq!(t.title(10).as_deref(), Some("list all t"));
    }
}
