use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::transcript::{ToolCallSegment, Transcript};

/// Retired entries kept for inspection.
pub const RETIRED_HISTORY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Confirmed,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl ToolCallStatus {
    /// Occupies the single active slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Executing)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Pending, Self::Rejected)
                | (Self::Confirmed, Self::Executing)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Failed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub call_id: ToolCallId,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl LedgerEntry {
    pub fn pending(call: &ToolCallSegment) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("tool call {active} is already in flight; cannot admit {rejected}")]
    ConcurrentToolCall { active: ToolCallId, rejected: ToolCallId },
    #[error("no active tool call with id {0}")]
    NotActive(ToolCallId),
    #[error("tool call {call_id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        call_id: ToolCallId,
        from: ToolCallStatus,
        to: ToolCallStatus,
    },
}

/// Serialized form stored inside the session record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<LedgerEntry>,
    #[serde(default)]
    pub retired: Vec<LedgerEntry>,
}

/// Tracks tool calls from admission to result. Holds at most one active
/// entry per session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolLedger {
    active: Option<LedgerEntry>,
    retired: VecDeque<LedgerEntry>,
}

impl ToolLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_admit(&mut self, call: &ToolCallSegment) -> Result<&LedgerEntry, LedgerError> {
        if let Some(active) = &self.active {
            return Err(LedgerError::ConcurrentToolCall {
                active: active.call_id.clone(),
                rejected: call.call_id.clone(),
            });
        }
        Ok(self.active.insert(LedgerEntry::pending(call)))
    }

    /// Move the active entry to `next`. Terminal statuses retire it.
    pub fn resolve(
        &mut self,
        call_id: &ToolCallId,
        next: ToolCallStatus,
    ) -> Result<&LedgerEntry, LedgerError> {
        let entry = match self.active.as_mut() {
            Some(entry) if &entry.call_id == call_id => entry,
            _ => return Err(LedgerError::NotActive(call_id.clone())),
        };
        if !entry.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                call_id: call_id.clone(),
                from: entry.status,
                to: next,
            });
        }
        entry.status = next;
        if next.is_active() {
            return self.active.as_ref().ok_or_else(|| LedgerError::NotActive(call_id.clone()));
        }

        entry.resolved_at = Some(Utc::now());
        let Some(done) = self.active.take() else {
            return Err(LedgerError::NotActive(call_id.clone()));
        };
        self.retire(done);
        self.retired.back().ok_or_else(|| LedgerError::NotActive(call_id.clone()))
    }

    /// Record a call that was never admitted (a second call in one turn).
    pub fn record_refused(&mut self, call: &ToolCallSegment) {
        let now = Utc::now();
        self.retire(LedgerEntry {
            status: ToolCallStatus::Rejected,
            requested_at: now,
            resolved_at: Some(now),
            ..LedgerEntry::pending(call)
        });
    }

    /// Drop the active entry without a transition, used when the session is
    /// torn down while a call waits for confirmation.
    pub fn abandon(&mut self) -> Option<LedgerEntry> {
        let mut entry = self.active.take()?;
        entry.status = ToolCallStatus::Rejected;
        entry.resolved_at = Some(Utc::now());
        self.retire(entry.clone());
        Some(entry)
    }

    pub fn active_entry(&self) -> Option<&LedgerEntry> {
        self.active.as_ref()
    }

    pub fn retired(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.retired.iter()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            active: self.active.clone(),
            retired: self.retired.iter().cloned().collect(),
        }
    }

    /// Recompute the ledger from the transcript. The transcript is the source
    /// of truth: a trailing unresolved call becomes the pending entry, and the
    /// snapshot only contributes history and the original request time.
    pub fn recover(transcript: &Transcript, snapshot: &LedgerSnapshot) -> Self {
        let mut ledger = Self {
            active: None,
            retired: snapshot.retired.iter().cloned().collect(),
        };
        while ledger.retired.len() > RETIRED_HISTORY {
            ledger.retired.pop_front();
        }
        if let Some(call) = transcript.unresolved_calls().first() {
            let mut entry = LedgerEntry::pending(call);
            if let Some(prev) = snapshot.active.as_ref().filter(|e| e.call_id == call.call_id) {
                entry.requested_at = prev.requested_at;
            }
            ledger.active = Some(entry);
        }
        ledger
    }

    fn retire(&mut self, entry: LedgerEntry) {
        if self.retired.len() == RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back(entry);
    }
}
