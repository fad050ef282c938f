use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use parley_core::events::SessionEvent;
use parley_core::ids::SessionId;
use parley_core::record::SessionSummary;

use crate::actor::SessionHandle;
use crate::engine::{EngineDeps, SessionEngine};
use crate::error::EngineError;

/// Live sessions keyed by id. Engines are built lazily from the store and
/// dropped back to it when idle.
pub struct SessionRegistry {
    deps: EngineDeps,
    sessions: DashMap<SessionId, SessionHandle>,
    /// Actors that are shutting down. A session is not reloaded from the
    /// store until its old actor has stopped.
    retiring: DashMap<SessionId, SessionHandle>,
    /// Serializes load-or-create so two connections never spawn two actors
    /// for the same session.
    create_lock: tokio::sync::Mutex<()>,
}

impl SessionRegistry {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            sessions: DashMap::new(),
            retiring: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.deps.events.subscribe()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_live(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Handle for a session that is already running.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions
            .get(session_id)
            .map(|h| h.clone())
            .filter(SessionHandle::is_alive)
    }

    /// Start a brand new session and save it right away.
    pub async fn create(&self) -> Result<SessionHandle, EngineError> {
        let (handle, _) = self.get_or_create(&SessionId::new()).await?;
        Ok(handle)
    }

    /// Return the live handle, resume from the store, or start a new session
    /// under `session_id`. The flag is true when the session already existed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn get_or_create(&self, session_id: &SessionId) -> Result<(SessionHandle, bool), EngineError> {
        loop {
            if let Some(handle) = self.get(session_id) {
                return Ok((handle, true));
            }
            if let Some(old) = self.retiring.get(session_id).map(|h| h.clone()) {
                debug!("waiting for previous actor to stop");
                old.stopped().await;
                continue;
            }
            let _guard = self.create_lock.lock().await;
            if let Some(handle) = self.get(session_id) {
                return Ok((handle, true));
            }
            if self.retiring.contains_key(session_id) {
                continue;
            }
            return self.spawn_session(session_id).await;
        }
    }

    async fn spawn_session(&self, session_id: &SessionId) -> Result<(SessionHandle, bool), EngineError> {
        let (engine, resumed) = match self.deps.store.load(session_id).await? {
            Some(record) => {
                info!(turns = record.transcript.len(), "resuming session from store");
                if let Err(e) = self.deps.store.touch(session_id).await {
                    warn!(error = %e, "failed to touch resumed session");
                }
                (SessionEngine::from_record(record, self.deps.clone()), true)
            }
            None => {
                let mut engine = SessionEngine::new(session_id.clone(), self.deps.clone());
                engine.flush().await?;
                info!("created session");
                (engine, false)
            }
        };

        let (handle, _task) = SessionHandle::spawn(engine);
        self.sessions.insert(session_id.clone(), handle.clone());
        Ok((handle, resumed))
    }

    /// Resume an existing session. Unlike `get_or_create` this never makes
    /// a new one.
    pub async fn open(&self, session_id: &SessionId) -> Result<SessionHandle, EngineError> {
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }
        if self.deps.store.load(session_id).await?.is_none() {
            return Err(EngineError::SessionNotFound(session_id.clone()));
        }
        let (handle, _) = self.get_or_create(session_id).await?;
        Ok(handle)
    }

    /// Flush and stop a live session. Commands already queued still run.
    /// Returns false if it was not live.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn evict(&self, session_id: &SessionId) -> Result<bool, EngineError> {
        self.retire(session_id, false).await
    }

    /// The transport for a session went away: cancel in-flight work (which
    /// rolls back to the last commit), drop queued events and evict.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn disconnect(&self, session_id: &SessionId) -> Result<bool, EngineError> {
        self.retire(session_id, true).await
    }

    async fn retire(&self, session_id: &SessionId, drain: bool) -> Result<bool, EngineError> {
        let Some(handle) = self.sessions.get(session_id).map(|h| h.clone()) else {
            return Ok(false);
        };
        // Visible as retiring before it leaves the live map.
        self.retiring.insert(session_id.clone(), handle.clone());
        if drain {
            handle.drain();
        } else {
            handle.retire();
        }
        self.sessions.remove_if(session_id, |_, h| h.same_actor(&handle));

        let result = match handle.shutdown().await {
            Ok(_) | Err(EngineError::SessionGone(_)) => Ok(true),
            Err(e) => Err(e),
        };
        handle.stopped().await;
        self.retiring.remove_if(session_id, |_, h| h.same_actor(&handle));
        debug!(drained = drain, "session evicted");
        result
    }

    /// Terminate a session and remove it from the live set. Its record stays
    /// in the store.
    pub async fn close(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let handle = self.open(session_id).await?;
        handle.interrupt();
        handle.close().await?;
        self.evict(session_id).await?;
        Ok(())
    }

    /// Remove a session everywhere. Returns whether the store had it.
    pub async fn delete(&self, session_id: &SessionId) -> Result<bool, EngineError> {
        self.retire(session_id, true).await?;
        Ok(self.deps.store.delete(session_id).await?)
    }

    pub async fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<SessionSummary>, EngineError> {
        Ok(self.deps.store.list(limit, offset).await?)
    }

    /// Evict every live session idle for at least `max_idle`. Sessions in the
    /// middle of a command are skipped.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                !handle.is_alive() || (!handle.is_busy() && handle.last_activity().elapsed() >= max_idle)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for session_id in stale {
            match self.evict(&session_id).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "idle eviction failed"),
            }
        }
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "evicted idle sessions");
        }
        evicted
    }

    /// Run `evict_idle` every `interval` until `cancel` fires.
    pub fn start_eviction_task(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_idle(max_idle).await;
                    }
                }
            }
            debug!("eviction task stopped");
        })
    }

    /// Interrupt and flush every live session. Returns how many were stopped.
    pub async fn shutdown_all(&self) -> usize {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.drain();
        }
        let mut stopped = 0;
        for handle in handles {
            let session_id = handle.session_id().clone();
            match self.retire(&session_id, true).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session_id, error = %e, "flush on shutdown failed"),
            }
        }
        info!(stopped, "all sessions shut down");
        stopped
    }
}
