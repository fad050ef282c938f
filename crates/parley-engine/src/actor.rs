//! Session actor: owns one `SessionEngine` and serializes every command
//! sent to it through a bounded mailbox.
//!
//! Cancellation bypasses the mailbox. Each command runs under a fresh
//! token that `SessionHandle::interrupt` can reach while the command is
//! still in flight. `SessionHandle::drain` goes further: queued inward
//! events are answered with `Cancelled` instead of being run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::events::InwardEvent;
use parley_core::ids::SessionId;

use crate::engine::{EngineSnapshot, SessionEngine};
use crate::error::EngineError;

pub const MAILBOX_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum SessionCommand {
    Handle { event: InwardEvent, reply: Reply<()> },
    Snapshot { reply: oneshot::Sender<EngineSnapshot> },
    Flush { reply: Reply<bool> },
    Close { reply: Reply<()> },
    Shutdown { reply: Reply<bool> },
}

struct Shared {
    cancel: Mutex<CancellationToken>,
    busy: AtomicBool,
    last_activity: Mutex<Instant>,
    /// Set once the actor is being shut down; it takes no new work.
    retiring: AtomicBool,
    draining: AtomicBool,
    /// Cancelled when the actor task has exited.
    stopped: CancellationToken,
}

/// Cloneable address of a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    tx: mpsc::Sender<SessionCommand>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("busy", &self.is_busy())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl SessionHandle {
    /// Move `engine` onto its own task and return its address.
    pub fn spawn(engine: SessionEngine) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let shared = Arc::new(Shared {
            cancel: Mutex::new(CancellationToken::new()),
            busy: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
            retiring: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            stopped: CancellationToken::new(),
        });
        let handle = Self {
            session_id: engine.session_id().clone(),
            tx,
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(run_actor(engine, rx, shared));
        (handle, task)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Cancel whatever the session is doing right now. Queued commands are
    /// not affected.
    pub fn interrupt(&self) {
        if self.is_busy() {
            debug!(session_id = %self.session_id, "interrupting in-flight command");
        }
        self.shared.cancel.lock().cancel();
    }

    /// Stop taking work: cancel the running command and answer every queued
    /// inward event with `Cancelled`. Snapshot, flush and shutdown commands
    /// still run.
    pub fn drain(&self) {
        self.retire();
        self.shared.draining.store(true, Ordering::Release);
        self.interrupt();
    }

    /// Mark the actor as on its way out so registries stop handing it out.
    pub fn retire(&self) {
        self.shared.retiring.store(true, Ordering::Release);
    }

    /// Wait until the actor task has exited.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }

    /// Whether both handles address the same actor task.
    pub fn same_actor(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    /// Whether the actor task is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed() && !self.shared.retiring.load(Ordering::Acquire)
    }

    /// Queue an inward event and return a receiver for its outcome. Lets a
    /// transport keep reading input (and deliver interrupts) while earlier
    /// events are still being processed, without reordering them.
    pub async fn submit(&self, event: InwardEvent) -> Result<oneshot::Receiver<Result<(), EngineError>>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Handle { event, reply }).await?;
        Ok(rx)
    }

    /// Process one inward event and wait for it to finish.
    pub async fn handle(&self, event: InwardEvent) -> Result<(), EngineError> {
        let rx = self.submit(event).await?;
        self.await_reply(rx).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| EngineError::SessionGone(self.session_id.clone()))
    }

    pub async fn flush(&self) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Flush { reply }).await?;
        self.await_reply(rx).await
    }

    pub async fn close(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Close { reply }).await?;
        self.await_reply(rx).await
    }

    /// Flush and stop the actor. Returns whether a final save happened.
    pub async fn shutdown(&self) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { reply }).await?;
        self.await_reply(rx).await
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), EngineError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::SessionGone(self.session_id.clone()))
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<Result<T, EngineError>>) -> Result<T, EngineError> {
        rx.await
            .map_err(|_| EngineError::SessionGone(self.session_id.clone()))?
    }
}

async fn run_actor(mut engine: SessionEngine, mut rx: mpsc::Receiver<SessionCommand>, shared: Arc<Shared>) {
    let session_id = engine.session_id().clone();
    let _stopped = shared.stopped.clone().drop_guard();
    debug!(session_id = %session_id, state = %engine.state(), "session actor started");

    while let Some(cmd) = rx.recv().await {
        let cancel = CancellationToken::new();
        *shared.cancel.lock() = cancel.clone();
        shared.busy.store(true, Ordering::Release);

        let stop = match cmd {
            SessionCommand::Handle { event, reply } => {
                if shared.draining.load(Ordering::Acquire) {
                    debug!(session_id = %session_id, event_type = event.event_type(), "dropping queued event");
                    let _ = reply.send(Err(EngineError::Cancelled));
                } else {
                    let _ = reply.send(engine.handle(event, &cancel).await);
                }
                false
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(engine.snapshot());
                false
            }
            SessionCommand::Flush { reply } => {
                let _ = reply.send(engine.flush().await);
                false
            }
            SessionCommand::Close { reply } => {
                let _ = reply.send(engine.close().await);
                false
            }
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(engine.flush().await);
                true
            }
        };

        shared.busy.store(false, Ordering::Release);
        *shared.last_activity.lock() = Instant::now();
        if stop {
            info!(session_id = %session_id, "session actor stopped");
            return;
        }
    }

    // Every handle dropped without an explicit shutdown.
    if let Err(e) = engine.flush().await {
        warn!(session_id = %session_id, error = %e, "final flush failed");
    }
    debug!(session_id = %session_id, "session actor released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use parley_core::events::OutwardEvent;
    use parley_llm::{MockProvider, MockResponse, RetryConfig, RetryingModelClient};
    use parley_store::{MemorySessionStore, SessionStore};
    use tokio::sync::broadcast;

    use crate::engine::{EngineConfig, EngineDeps, SessionState};
    use crate::tools::ToolRegistry;

    fn deps(responses: Vec<MockResponse>) -> (EngineDeps, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        let (events, _) = broadcast::channel(256);
        let deps = EngineDeps {
            model: Arc::new(RetryingModelClient::new(
                MockProvider::new(responses),
                RetryConfig {
                    base_delay: Duration::from_millis(1),
                    jitter_factor: 0.0,
                    ..Default::default()
                },
            )),
            tools: Arc::new(ToolRegistry::new()),
            store: store.clone(),
            events,
            config: Arc::new(EngineConfig::default()),
        };
        (deps, store)
    }

    fn user(text: &str) -> InwardEvent {
        InwardEvent::UserMessage {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn commands_are_processed_in_order() {
        let (deps, _store) = deps(vec![MockResponse::text("one"), MockResponse::text("two")]);
        let mut events = deps.events.subscribe();
        let (handle, _task) = SessionHandle::spawn(SessionEngine::new(SessionId::new(), deps));

        let first = handle.submit(user("a")).await.unwrap();
        let second = handle.submit(user("b")).await.unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.record.transcript.len(), 4);

        let mut completed = Vec::new();
        while let Ok(ev) = events.try_recv() {
            if let OutwardEvent::MessageComplete { content, .. } = ev.event {
                completed.push(content);
            }
        }
        assert_eq!(completed, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn interrupt_reaches_in_flight_command() {
        let (deps, store) = deps(vec![MockResponse::text_then_hang("par")]);
        let id = SessionId::new();
        let (handle, _task) = SessionHandle::spawn(SessionEngine::new(id.clone(), deps));

        let pending = handle.submit(user("hang")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_busy());
        handle.interrupt();
        pending.await.unwrap().unwrap();

        assert!(!handle.is_busy());
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.record.transcript.len(), 1);
        assert_eq!(store.load(&id).await.unwrap().unwrap().transcript.len(), 1);
    }

    #[tokio::test]
    async fn caller_errors_come_back_through_reply() {
        let (deps, _store) = deps(vec![]);
        let (handle, _task) = SessionHandle::spawn(SessionEngine::new(SessionId::new(), deps));
        let err = handle
            .handle(InwardEvent::ToolConfirm {
                call_id: parley_core::ids::ToolCallId::from_raw("toolu_x"),
                confirmed: true,
                rejection_reason: None,
            })
            .await
            .unwrap_err();
        assert_matches!(err, EngineError::InvalidState { .. });
    }

    #[tokio::test]
    async fn shutdown_flushes_and_stops() {
        let (deps, store) = deps(vec![]);
        let id = SessionId::new();
        let (handle, task) = SessionHandle::spawn(SessionEngine::new(id.clone(), deps));

        assert!(handle.shutdown().await.unwrap());
        task.await.unwrap();
        assert!(store.load(&id).await.unwrap().is_some());
        assert!(!handle.is_alive());
        assert_matches!(handle.snapshot().await, Err(EngineError::SessionGone(_)));
    }

    #[tokio::test]
    async fn drain_cancels_queued_events() {
        let (deps, store) = deps(vec![
            MockResponse::text_then_hang("par"),
            MockResponse::text("never sent"),
        ]);
        let id = SessionId::new();
        let (handle, task) = SessionHandle::spawn(SessionEngine::new(id.clone(), deps));

        let first = handle.submit(user("hang")).await.unwrap();
        let second = handle.submit(user("queued")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.drain();
        assert!(!handle.is_alive());

        first.await.unwrap().unwrap();
        assert_matches!(second.await.unwrap(), Err(EngineError::Cancelled));
        handle.shutdown().await.unwrap();
        handle.stopped().await;
        task.await.unwrap();

        let record = store.load(&id).await.unwrap().unwrap();
        assert_eq!(record.transcript.len(), 1);
    }

    #[tokio::test]
    async fn stopped_resolves_after_shutdown() {
        let (deps, _store) = deps(vec![]);
        let (handle, _task) = SessionHandle::spawn(SessionEngine::new(SessionId::new(), deps));
        let other = handle.clone();
        assert!(handle.same_actor(&other));
        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), other.stopped())
            .await
            .unwrap();
        assert!(format!("{handle:?}").contains("SessionHandle"));
    }

    #[tokio::test]
    async fn dropping_every_handle_flushes() {
        let (deps, store) = deps(vec![]);
        let id = SessionId::new();
        let (handle, task) = SessionHandle::spawn(SessionEngine::new(id.clone(), deps));
        drop(handle);
        task.await.unwrap();
        assert!(store.load(&id).await.unwrap().is_some());
    }
}
