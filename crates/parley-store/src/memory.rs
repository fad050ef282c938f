use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use parley_core::ids::SessionId;
use parley_core::record::{SessionRecord, SessionSummary};

use crate::error::StoreError;
use crate::store::SessionStore;

struct Stored {
    record: SessionRecord,
    last_active_at: DateTime<Utc>,
}

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySessionStore {
    records: DashMap<SessionId, Stored>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_active(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.records.get(session_id).map(|s| s.last_active_at)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.records.insert(
            record.session_id.clone(),
            Stored {
                record: record.clone(),
                last_active_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.get(session_id).map(|s| s.record.clone()))
    }

    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<SessionSummary> = self.records.iter().map(|s| s.record.summary()).collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.session_id.as_str().cmp(a.session_id.as_str()))
        });
        Ok(summaries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.records.remove(session_id).is_some())
    }

    async fn touch(&self, session_id: &SessionId) -> Result<(), StoreError> {
        match self.records.get_mut(session_id) {
            Some(mut stored) => {
                stored.last_active_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {session_id}"))),
        }
    }
}
