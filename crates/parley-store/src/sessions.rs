use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tracing::{debug, instrument};

use parley_core::ids::SessionId;
use parley_core::record::{SessionRecord, SessionSummary};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::store::SessionStore;

const TABLE: &str = "sessions";

/// Fixed-width timestamps so text ordering matches time ordering.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite-backed store: one row per session, upserted on every save.
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Database,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run a synchronous query on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

fn save_record(db: &Database, record: &SessionRecord) -> Result<(), StoreError> {
    let summary = record.summary();
    let json = serde_json::to_string(record)?;
    let now = timestamp(Utc::now());

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO sessions (id, created_at, updated_at, last_active_at, title, turn_count,
                                   total_input_tokens, total_output_tokens, auto_confirm,
                                   awaiting_confirmation, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                updated_at = excluded.updated_at,
                last_active_at = excluded.last_active_at,
                title = excluded.title,
                turn_count = excluded.turn_count,
                total_input_tokens = excluded.total_input_tokens,
                total_output_tokens = excluded.total_output_tokens,
                auto_confirm = excluded.auto_confirm,
                awaiting_confirmation = excluded.awaiting_confirmation,
                record = excluded.record",
            rusqlite::params![
                record.session_id.as_str(),
                timestamp(record.created_at),
                timestamp(record.updated_at),
                now,
                summary.title,
                summary.turn_count as i64,
                summary.total_input_tokens as i64,
                summary.total_output_tokens as i64,
                summary.auto_confirm,
                summary.awaiting_confirmation,
                json,
            ],
        )?;
        Ok(())
    })
}

fn load_record(db: &Database, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
    db.with_conn(|conn| {
        let raw: Option<String> = conn
            .query_row("SELECT record FROM sessions WHERE id = ?1", [id.as_str()], |row| row.get(0))
            .optional()?;
        raw.map(|r| row_helpers::parse_json(&r, TABLE, "record")).transpose()
    })
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> Result<SessionSummary, StoreError> {
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let created_at: String = row_helpers::get(row, 1, TABLE, "created_at")?;
    let updated_at: String = row_helpers::get(row, 2, TABLE, "updated_at")?;
    let turn_count: i64 = row_helpers::get(row, 4, TABLE, "turn_count")?;
    let input: i64 = row_helpers::get(row, 5, TABLE, "total_input_tokens")?;
    let output: i64 = row_helpers::get(row, 6, TABLE, "total_output_tokens")?;

    Ok(SessionSummary {
        session_id: SessionId::from_raw(id),
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, TABLE, "updated_at")?,
        title: row_helpers::get_opt(row, 3, TABLE, "title")?,
        turn_count: turn_count.max(0) as usize,
        total_input_tokens: input.max(0) as u64,
        total_output_tokens: output.max(0) as u64,
        auto_confirm: row_helpers::get(row, 7, TABLE, "auto_confirm")?,
        awaiting_confirmation: row_helpers::get(row, 8, TABLE, "awaiting_confirmation")?,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, record), fields(session_id = %record.session_id, turns = record.transcript.len()))]
    async fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |db| save_record(db, &record)).await?;
        debug!("session saved");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn load(&self, session_id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let id = session_id.clone();
        self.blocking(move |db| load_record(db, &id)).await
    }

    #[instrument(skip(self))]
    async fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionSummary>, StoreError> {
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, created_at, updated_at, title, turn_count, total_input_tokens,
                            total_output_tokens, auto_confirm, awaiting_confirmation
                     FROM sessions
                     ORDER BY updated_at DESC, id DESC
                     LIMIT ?1 OFFSET ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit, offset])?;
                let mut results = Vec::new();
                while let Some(row) = rows.next()? {
                    results.push(row_to_summary(row)?);
                }
                Ok(results)
            })
        })
        .await
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn delete(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let id = session_id.clone();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
                Ok(changed > 0)
            })
        })
        .await
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn touch(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let id = session_id.clone();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let changed = conn.execute(
                    "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
                    rusqlite::params![timestamp(Utc::now()), id.as_str()],
                )?;
                if changed == 0 {
                    return Err(StoreError::NotFound(format!("session {id}")));
                }
                Ok(())
            })
        })
        .await
    }
}
