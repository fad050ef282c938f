use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use parley_core::errors::ProviderError;
use parley_core::events::{InwardEvent, OutwardEvent, SessionEvent, StreamType};
use parley_core::ids::{SessionId, ToolCallId};
use parley_core::ledger::{LedgerEntry, LedgerError, LedgerSnapshot, ToolCallStatus, ToolLedger};
use parley_core::provider::{ModelClient, ModelRequest, StreamOptions};
use parley_core::record::{ConversationSnapshot, SessionRecord};
use parley_core::stream::StreamEvent;
use parley_core::tokens::TokenAccount;
use parley_core::tools::{ToolContext, ToolExecutionError, ToolExecutor, ToolPreview};
use parley_core::transcript::{
    Attachment, ResultOutcome, ToolCallSegment, ToolResultTurn, Transcript, TranscriptError, UserTurn,
};
use parley_store::SessionStore;

use crate::error::EngineError;

pub const DEFAULT_MAX_AUTO_ROUNDS: u32 = 25;

/// Result text for a call refused because another call in the same turn was admitted.
pub const REFUSED_CALL_MESSAGE: &str = "Error: only one tool call may run at a time; this call was not executed.";
/// Result text for a call still pending when its session is closed.
pub const CLOSED_CALL_MESSAGE: &str = "Error: Tool execution cancelled: session closed.";

pub fn rejection_message(reason: Option<&str>) -> String {
    match reason.map(str::trim).filter(|r| !r.is_empty()) {
        Some(reason) => format!("Error: Tool execution cancelled by user. Reason: {reason}"),
        None => "Error: Tool execution cancelled by user.".to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingModel,
    Streaming,
    AwaitingConfirmation,
    ExecutingTool,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingModel => "awaiting_model",
            Self::Streaming => "streaming",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::ExecutingTool => "executing_tool",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-process settings every session engine shares.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub system_prompt: Option<String>,
    pub stream_options: StreamOptions,
    pub working_directory: PathBuf,
    /// Initial auto-confirm flag for new sessions.
    pub auto_confirm: bool,
    /// Auto-confirmed tool rounds allowed per user message.
    pub max_auto_rounds: u32,
    pub tool_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            stream_options: StreamOptions::default(),
            working_directory: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            auto_confirm: false,
            max_auto_rounds: DEFAULT_MAX_AUTO_ROUNDS,
            tool_timeout: None,
        }
    }
}

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct EngineDeps {
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<dyn ToolExecutor>,
    pub store: Arc<dyn SessionStore>,
    pub events: broadcast::Sender<SessionEvent>,
    pub config: Arc<EngineConfig>,
}

/// Stamps outward events with the session id and a per-session sequence
/// number, then publishes them on the process-wide channel.
struct EventSink {
    session_id: SessionId,
    tx: broadcast::Sender<SessionEvent>,
    next_seq: u64,
}

impl EventSink {
    fn emit(&mut self, event: OutwardEvent) {
        let event_type = event.event_type();
        let stamped = SessionEvent {
            session_id: self.session_id.clone(),
            seq: self.next_seq,
            timestamp: Utc::now(),
            event,
        };
        self.next_seq += 1;
        if self.tx.send(stamped).is_err() {
            warn!(session_id = %self.session_id, event_type, "no event receivers, event dropped");
        }
    }
}

/// Point-in-time view of a session for inspection and reconnects.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub state: SessionState,
    pub record: SessionRecord,
    pub pending_tool_call: Option<LedgerEntry>,
}

/// Per-conversation state machine.
///
/// Drives a turn from user input through model streaming, tool confirmation
/// and execution, and back to `Idle`. Every committed step is saved through
/// the store; anything not yet committed is discarded when a turn fails or is
/// cancelled.
pub struct SessionEngine {
    session_id: SessionId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    state: SessionState,
    transcript: Transcript,
    ledger: ToolLedger,
    tokens: TokenAccount,
    auto_confirm: bool,
    auto_rounds: u32,
    /// Last committed record; rollback target.
    checkpoint: SessionRecord,
    unsaved: bool,
    deps: EngineDeps,
    events: EventSink,
}

impl SessionEngine {
    pub fn new(session_id: SessionId, deps: EngineDeps) -> Self {
        let record = SessionRecord::new(session_id, deps.config.auto_confirm);
        let mut engine = Self::from_record(record, deps);
        engine.unsaved = true;
        engine
    }

    /// Rebuild an engine from a stored record. The ledger is recomputed from
    /// the transcript; a trailing unresolved call resumes as pending.
    pub fn from_record(mut record: SessionRecord, deps: EngineDeps) -> Self {
        let ledger = ToolLedger::recover(&record.transcript, &record.ledger);
        record.ledger = ledger.snapshot();
        let state = if ledger.active_entry().is_some() {
            SessionState::AwaitingConfirmation
        } else {
            SessionState::Idle
        };
        let events = EventSink {
            session_id: record.session_id.clone(),
            tx: deps.events.clone(),
            next_seq: 0,
        };
        Self {
            session_id: record.session_id.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            state,
            transcript: record.transcript.clone(),
            ledger,
            tokens: record.token_account.clone(),
            auto_confirm: record.auto_confirm,
            auto_rounds: 0,
            checkpoint: record,
            unsaved: false,
            deps,
            events,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn ledger(&self) -> &ToolLedger {
        &self.ledger
    }

    pub fn token_account(&self) -> &TokenAccount {
        &self.tokens
    }

    pub fn auto_confirm(&self) -> bool {
        self.auto_confirm
    }

    /// Current state as a storable record.
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            transcript: self.transcript.clone(),
            ledger: self.ledger.snapshot(),
            token_account: self.tokens.clone(),
            auto_confirm: self.auto_confirm,
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state,
            record: self.record(),
            pending_tool_call: self.ledger.active_entry().cloned(),
        }
    }

    /// Save the last committed record if the store has not seen it yet.
    /// Returns whether a save happened.
    pub async fn flush(&mut self) -> Result<bool, EngineError> {
        if !self.unsaved {
            return Ok(false);
        }
        self.deps.store.save(&self.checkpoint).await?;
        self.unsaved = false;
        debug!(session_id = %self.session_id, "session flushed");
        Ok(true)
    }

    /// Process one inward event to completion.
    ///
    /// Caller mistakes (wrong state, stale confirmation, conflicting load)
    /// come back as `Err` with nothing mutated. Failures inside a turn are
    /// surfaced as outward `error` events after rolling back, and return `Ok`.
    #[instrument(skip_all, fields(session_id = %self.session_id, event_type = event.event_type()))]
    pub async fn handle(&mut self, event: InwardEvent, cancel: &CancellationToken) -> Result<(), EngineError> {
        match event {
            InwardEvent::UserMessage { text, attachments } => {
                self.submit_user_message(text, attachments, cancel).await
            }
            InwardEvent::ToolConfirm {
                call_id,
                confirmed,
                rejection_reason,
            } => {
                self.resolve_confirmation(&call_id, confirmed, rejection_reason, cancel)
                    .await
            }
            InwardEvent::LoadConversation { snapshot } => self.load_conversation(snapshot).await,
            InwardEvent::UpdateAutoConfirm { enabled } => self.set_auto_confirm(enabled).await,
            InwardEvent::GetAutoConfirmState => self.get_auto_confirm_state(),
        }
    }

    pub async fn submit_user_message(
        &mut self,
        text: String,
        attachments: Vec<Attachment>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.expect_state(SessionState::Idle, "submit a user message")?;
        self.transcript
            .push_user(UserTurn::new(text).with_attachments(attachments))?;
        self.auto_rounds = 0;
        self.commit().await;
        self.drive(cancel).await;
        Ok(())
    }

    pub async fn resolve_confirmation(
        &mut self,
        call_id: &ToolCallId,
        confirmed: bool,
        rejection_reason: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.expect_state(SessionState::AwaitingConfirmation, "confirm a tool call")?;
        let entry = match self.ledger.active_entry() {
            Some(entry) if &entry.call_id == call_id => entry.clone(),
            active => {
                warn!(
                    call_id = %call_id,
                    pending = ?active.map(|e| e.call_id.as_str()),
                    "stale confirmation ignored"
                );
                return Err(EngineError::StaleConfirmation {
                    call_id: call_id.clone(),
                });
            }
        };

        let resolved = if confirmed {
            info!(call_id = %entry.call_id, tool = %entry.tool_name, "tool call confirmed");
            self.run_confirmed(&entry, cancel).await
        } else {
            info!(call_id = %entry.call_id, tool = %entry.tool_name, "tool call rejected");
            self.reject(&entry, rejection_reason.as_deref()).await
        };
        match resolved {
            Ok(()) => self.drive(cancel).await,
            Err(e) => self.fail_turn(e),
        }
        Ok(())
    }

    pub async fn load_conversation(&mut self, snapshot: ConversationSnapshot) -> Result<(), EngineError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Terminated => {
                return Err(EngineError::InvalidState {
                    operation: "load a conversation",
                    state: self.state,
                })
            }
            state => {
                return Err(EngineError::Conflict(format!(
                    "cannot load a conversation while session is {state}"
                )))
            }
        }

        let transcript = Transcript::from_turns(snapshot.transcript.turns().to_vec())?;
        self.transcript = transcript;
        self.tokens = snapshot.token_account;
        self.ledger = ToolLedger::recover(&self.transcript, &LedgerSnapshot::default());
        self.auto_rounds = 0;

        let turn_count = self.transcript.len();
        info!(session_id = %self.session_id, turn_count, "conversation loaded");
        self.events.emit(OutwardEvent::ConversationLoaded { turn_count });
        self.commit().await;
        if self.ledger.active_entry().is_some() {
            self.request_confirmation();
        }
        Ok(())
    }

    pub async fn set_auto_confirm(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.expect_live("update auto-confirm")?;
        self.auto_confirm = enabled;
        info!(session_id = %self.session_id, enabled, "auto-confirm updated");
        let notice = if enabled {
            "Auto-confirm enabled."
        } else {
            "Auto-confirm disabled."
        };
        self.events.emit(OutwardEvent::SystemNotice {
            message: notice.to_string(),
        });
        self.events.emit(OutwardEvent::AutoConfirmState { enabled });
        self.commit().await;
        Ok(())
    }

    pub fn get_auto_confirm_state(&mut self) -> Result<(), EngineError> {
        self.expect_live("read auto-confirm")?;
        self.events.emit(OutwardEvent::AutoConfirmState {
            enabled: self.auto_confirm,
        });
        Ok(())
    }

    /// Terminate the session. A call waiting for confirmation gets a
    /// synthetic cancelled result first.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if !matches!(self.state, SessionState::Idle | SessionState::AwaitingConfirmation) {
            return Err(EngineError::InvalidState {
                operation: "close",
                state: self.state,
            });
        }
        if let Some(entry) = self.ledger.abandon() {
            self.transcript.push_tool_result(ToolResultTurn::new(
                entry.call_id.clone(),
                entry.tool_name.clone(),
                CLOSED_CALL_MESSAGE,
                ResultOutcome::Cancelled,
            ))?;
            self.events.emit(OutwardEvent::ToolExecutionResult {
                call_id: entry.call_id,
                tool_name: entry.tool_name,
                result: CLOSED_CALL_MESSAGE.to_string(),
                is_error: true,
                artifacts: Vec::new(),
            });
        }
        self.commit().await;
        self.set_state(SessionState::Terminated);
        info!(session_id = %self.session_id, "session closed");
        self.events.emit(OutwardEvent::SystemNotice {
            message: "Session closed.".to_string(),
        });
        Ok(())
    }

    // --- Turn loop ---

    /// Run model turns until the model stops asking for tools or a call
    /// needs a human decision. Failures roll back and are surfaced.
    async fn drive(&mut self, cancel: &CancellationToken) {
        if let Err(e) = self.run_model_loop(cancel).await {
            self.fail_turn(e);
        }
    }

    async fn run_model_loop(&mut self, cancel: &CancellationToken) -> Result<(), EngineError> {
        let max_rounds = self.deps.config.max_auto_rounds;
        loop {
            let Some(call) = self.run_turn(cancel).await? else {
                self.set_state(SessionState::Idle);
                return Ok(());
            };

            if self.auto_confirm && self.auto_rounds < max_rounds {
                self.auto_rounds += 1;
                debug!(call_id = %call.call_id, round = self.auto_rounds, "auto-confirming tool call");
                let entry = self.ledger.resolve(&call.call_id, ToolCallStatus::Confirmed)?.clone();
                self.run_confirmed(&entry, cancel).await?;
                continue;
            }

            if self.auto_confirm {
                warn!(session_id = %self.session_id, max_rounds, "auto-confirm round limit reached");
                self.events.emit(OutwardEvent::SystemNotice {
                    message: format!(
                        "Auto-confirm limit of {max_rounds} tool calls reached; waiting for confirmation."
                    ),
                });
            }
            self.request_confirmation();
            return Ok(());
        }
    }

    /// One model call: stream, commit the assistant turn, and return the
    /// admitted tool call if there is one.
    async fn run_turn(&mut self, cancel: &CancellationToken) -> Result<Option<ToolCallSegment>, EngineError> {
        if let Some(call) = self.transcript.unresolved_calls().first() {
            return Err(TranscriptError::UnresolvedToolCall {
                call_id: call.call_id.clone(),
            }
            .into());
        }

        self.set_state(SessionState::AwaitingModel);
        let request = ModelRequest {
            system_prompt: self.deps.config.system_prompt.clone(),
            turns: self.transcript.turns().to_vec(),
            tools: self.deps.tools.definitions(),
            options: self.deps.config.stream_options.clone(),
        };
        let model = Arc::clone(&self.deps.model);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            res = model.stream_turn(&request) => res?,
        };
        self.set_state(SessionState::Streaming);

        let mut admitted: Option<ToolCallSegment> = None;
        let mut refused: Vec<ToolCallSegment> = Vec::new();
        let turn = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                ev = stream.next() => ev,
            };
            match next {
                Some(StreamEvent::TextDelta { text }) => self.events.emit(OutwardEvent::MessageChunk {
                    chunk: text,
                    stream_type: StreamType::Content,
                }),
                Some(StreamEvent::ThinkingDelta { text }) => self.events.emit(OutwardEvent::MessageChunk {
                    chunk: text,
                    stream_type: StreamType::Thinking,
                }),
                Some(StreamEvent::ToolCallAnnounced { call_id, tool_name }) => {
                    debug!(call_id = %call_id, tool = %tool_name, "tool call announced");
                }
                Some(StreamEvent::ToolCallArgsComplete { call }) => {
                    match self.ledger.try_admit(&call).map(|_| ()) {
                        Ok(()) => {
                            debug!(call_id = %call.call_id, tool = %call.tool_name, "tool call admitted");
                            admitted = Some(call);
                        }
                        Err(LedgerError::ConcurrentToolCall { active, .. }) if admitted.is_some() => {
                            warn!(
                                call_id = %call.call_id,
                                active = %active,
                                "refusing additional tool call in the same turn"
                            );
                            refused.push(call);
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(StreamEvent::TurnComplete { turn }) => break turn,
                Some(StreamEvent::StreamError { error }) => return Err(EngineError::Stream(error)),
                None => {
                    return Err(EngineError::Stream(ProviderError::StreamInterrupted(
                        "stream ended without a completed turn".into(),
                    )))
                }
            }
        };

        let content = turn.visible_text();
        let stop_reason = turn.stop_reason.clone();
        let usage = turn.usage.clone();
        self.transcript.push_assistant(turn)?;
        self.tokens.record(&usage);
        self.events.emit(OutwardEvent::MessageComplete { content, stop_reason });
        self.events.emit(OutwardEvent::token_usage(&usage, &self.tokens));

        if !refused.is_empty() {
            for call in &refused {
                self.ledger.record_refused(call);
                self.transcript.push_tool_result(ToolResultTurn::new(
                    call.call_id.clone(),
                    call.tool_name.clone(),
                    REFUSED_CALL_MESSAGE,
                    ResultOutcome::Failed,
                ))?;
            }
            let kept = admitted.as_ref().map(|c| c.call_id.as_str()).unwrap_or_default();
            self.events.emit(OutwardEvent::error(
                "protocol_violation",
                format!(
                    "Model requested {} tool calls in one turn; only {kept} will run.",
                    refused.len() + 1
                ),
                true,
            ));
        }

        self.commit().await;
        Ok(admitted)
    }

    fn request_confirmation(&mut self) {
        let Some(entry) = self.ledger.active_entry() else {
            return;
        };
        let preview = ToolPreview::for_call(&entry.tool_name, &entry.arguments);
        let event = OutwardEvent::ToolConfirmationRequested {
            call_id: entry.call_id.clone(),
            tool_name: entry.tool_name.clone(),
            tool_input: entry.arguments.clone(),
            code: preview.code,
            language: preview.language,
        };
        self.set_state(SessionState::AwaitingConfirmation);
        self.events.emit(event);
    }

    async fn reject(&mut self, entry: &LedgerEntry, reason: Option<&str>) -> Result<(), EngineError> {
        let message = rejection_message(reason);
        self.ledger.resolve(&entry.call_id, ToolCallStatus::Rejected)?;
        self.transcript.push_tool_result(ToolResultTurn::new(
            entry.call_id.clone(),
            entry.tool_name.clone(),
            message.clone(),
            ResultOutcome::Rejected,
        ))?;
        self.events.emit(OutwardEvent::SystemNotice { message });
        self.commit().await;
        Ok(())
    }

    /// Execute a call the user (or auto-confirm) approved and commit its result.
    async fn run_confirmed(&mut self, entry: &LedgerEntry, cancel: &CancellationToken) -> Result<(), EngineError> {
        if entry.status == ToolCallStatus::Pending {
            self.ledger.resolve(&entry.call_id, ToolCallStatus::Confirmed)?;
        }
        self.ledger.resolve(&entry.call_id, ToolCallStatus::Executing)?;
        self.set_state(SessionState::ExecutingTool);

        let preview = ToolPreview::for_call(&entry.tool_name, &entry.arguments);
        self.events.emit(OutwardEvent::ToolExecutionStart {
            call_id: entry.call_id.clone(),
            tool_name: entry.tool_name.clone(),
            tool_input: entry.arguments.clone(),
            code: preview.code,
            language: preview.language,
        });

        let ctx = ToolContext {
            session_id: self.session_id.clone(),
            call_id: entry.call_id.clone(),
            working_directory: self.deps.config.working_directory.clone(),
            cancel: cancel.child_token(),
        };
        let tools = Arc::clone(&self.deps.tools);
        let tool_timeout = self.deps.config.tool_timeout;
        let started = Instant::now();

        let run = AssertUnwindSafe(tools.execute(&entry.tool_name, entry.arguments.clone(), &ctx)).catch_unwind();
        let bounded = async move {
            match tool_timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };
        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            res = bounded => res,
        };

        let (content, artifacts, outcome) = match finished {
            Some(Ok(Ok(output))) => (output.result_text, output.artifacts, ResultOutcome::Completed),
            Some(Ok(Err(ToolExecutionError::Cancelled))) if cancel.is_cancelled() => {
                return Err(EngineError::Cancelled);
            }
            Some(Ok(Err(e))) => {
                warn!(call_id = %entry.call_id, tool = %entry.tool_name, error = %e, "tool execution failed");
                (format!("Error: {e}"), Vec::new(), ResultOutcome::Failed)
            }
            Some(Err(panic)) => {
                error!(
                    call_id = %entry.call_id,
                    tool = %entry.tool_name,
                    panic = %panic_message(panic.as_ref()),
                    "tool panicked during execution"
                );
                ("Error: tool crashed during execution".to_string(), Vec::new(), ResultOutcome::Failed)
            }
            None => {
                let secs = tool_timeout.unwrap_or_default().as_secs();
                warn!(call_id = %entry.call_id, tool = %entry.tool_name, timeout_secs = secs, "tool timed out");
                (format!("Error: Tool timed out after {secs}s"), Vec::new(), ResultOutcome::Failed)
            }
        };

        let status = if outcome.is_error() {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Completed
        };
        self.ledger.resolve(&entry.call_id, status)?;
        self.transcript.push_tool_result(ToolResultTurn {
            artifacts: artifacts.clone(),
            ..ToolResultTurn::new(entry.call_id.clone(), entry.tool_name.clone(), content.clone(), outcome)
        })?;
        info!(
            call_id = %entry.call_id,
            tool = %entry.tool_name,
            duration_ms = started.elapsed().as_millis() as u64,
            is_error = outcome.is_error(),
            "tool call finished"
        );
        self.events.emit(OutwardEvent::ToolExecutionResult {
            call_id: entry.call_id.clone(),
            tool_name: entry.tool_name.clone(),
            result: content,
            is_error: outcome.is_error(),
            artifacts,
        });
        self.commit().await;
        self.set_state(SessionState::AwaitingModel);
        Ok(())
    }

    // --- Commit / rollback ---

    /// Advance the checkpoint to the current state and save it. A failed
    /// save is surfaced but does not undo the commit; `flush` retries it.
    async fn commit(&mut self) {
        self.updated_at = Utc::now();
        self.checkpoint = self.record();
        match self.deps.store.save(&self.checkpoint).await {
            Ok(()) => self.unsaved = false,
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "failed to save session");
                self.unsaved = true;
                self.events.emit(OutwardEvent::error(
                    "persistence",
                    format!("Failed to save session: {e}"),
                    true,
                ));
            }
        }
    }

    fn rollback(&mut self) {
        self.transcript = self.checkpoint.transcript.clone();
        self.ledger = ToolLedger::recover(&self.checkpoint.transcript, &self.checkpoint.ledger);
        self.tokens = self.checkpoint.token_account.clone();
        let state = if self.ledger.active_entry().is_some() {
            SessionState::AwaitingConfirmation
        } else {
            SessionState::Idle
        };
        self.set_state(state);
    }

    fn fail_turn(&mut self, err: EngineError) {
        let during = self.state;
        self.rollback();
        if matches!(err, EngineError::Cancelled) {
            info!(session_id = %self.session_id, during = %during, "turn cancelled, rolled back to last commit");
            return;
        }
        warn!(
            session_id = %self.session_id,
            during = %during,
            kind = err.kind(),
            error = %err,
            "turn failed, rolled back to last commit"
        );
        self.events
            .emit(OutwardEvent::error(err.kind(), err.to_string(), err.is_recoverable()));
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(session_id = %self.session_id, from = %self.state, to = %next, "state transition");
            self.state = next;
        }
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<(), EngineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn expect_live(&self, operation: &'static str) -> Result<(), EngineError> {
        if self.state == SessionState::Terminated {
            return Err(EngineError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
