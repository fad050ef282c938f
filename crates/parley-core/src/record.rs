use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::ledger::LedgerSnapshot;
use crate::tokens::TokenAccount;
use crate::transcript::Transcript;

/// Listing titles are cut to this many characters.
pub const TITLE_MAX_CHARS: usize = 80;

/// The unit of crash recovery: everything needed to rebuild a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transcript: Transcript,
    #[serde(default)]
    pub ledger: LedgerSnapshot,
    #[serde(default)]
    pub token_account: TokenAccount,
    #[serde(default)]
    pub auto_confirm: bool,
}

impl SessionRecord {
    pub fn new(session_id: SessionId, auto_confirm: bool) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            updated_at: now,
            transcript: Transcript::new(),
            ledger: LedgerSnapshot::default(),
            token_account: TokenAccount::default(),
            auto_confirm,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            turn_count: self.transcript.len(),
            title: self.transcript.title(TITLE_MAX_CHARS),
            total_input_tokens: self.token_account.input_tokens,
            total_output_tokens: self.token_account.output_tokens,
            auto_confirm: self.auto_confirm,
            awaiting_confirmation: !self.transcript.unresolved_calls().is_empty(),
        }
    }
}

/// Listing view of a stored session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub auto_confirm: bool,
    pub awaiting_confirmation: bool,
}

/// A whole conversation as a client uploads it to replace session state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub transcript: Transcript,
    #[serde(default)]
    pub token_account: TokenAccount,
}
