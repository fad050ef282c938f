use async_trait::async_trait;

use parley_core::ids::SessionId;
use parley_core::record::{SessionRecord, SessionSummary};

use crate::error::StoreError;

/// Durable home of session records, keyed by session id.
///
/// Writes for one session are last-writer-wins; reads may run concurrently.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace the record.
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError>;

    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Newest-updated first.
    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionSummary>, StoreError>;

    /// Returns whether a record existed.
    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    /// Mark the session as recently active without rewriting the record.
    async fn touch(&self, session_id: &SessionId) -> Result<(), StoreError>;
}
