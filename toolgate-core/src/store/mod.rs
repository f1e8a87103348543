//! Catalog store — typed repositories over SQLite.
//!
//! All durable state lives here: apps, functions, projects, agents, app
//! configurations, linked accounts, triggers, trigger events, OAuth1 temp
//! tokens, and search feedback. Callers only go through the typed methods;
//! there are no ad-hoc queries outside this module.
//!
//! Embedding vectors are stored as little-endian `f32` BLOBs; vector
//! ranking computes cosine distance in process over the SQL-filtered
//! candidate set. Timestamps are RFC 3339 TEXT with fixed precision so
//! string comparison matches chronological order.

mod app_configurations;
mod apps;
pub mod cursor;
mod feedback;
mod functions;
mod linked_accounts;
mod oauth1_tokens;
mod projects;
mod trigger_events;
mod triggers;

pub use feedback::NewSearchFeedback;
pub use functions::FunctionQuery;
pub use linked_accounts::LinkedAccountPage;

use crate::error::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// The catalog store. One mutex-guarded connection; the worker-per-request
/// model tolerates the brief blocking.
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (and bootstrap) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (tests, ephemeral deployments).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // Poison-safe: a panicked writer leaves the data consistent enough
        // to keep serving reads.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS apps (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            description TEXT NOT NULL,
            provider TEXT NOT NULL,
            categories TEXT NOT NULL,
            visibility TEXT NOT NULL,
            active INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            security_schemes TEXT NOT NULL,
            default_security_credentials TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS functions (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL,
            parameters TEXT NOT NULL,
            protocol TEXT NOT NULL,
            protocol_data TEXT NOT NULL,
            visibility TEXT NOT NULL,
            active INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_functions_app_id ON functions(app_id);

        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            visibility_access TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            api_key TEXT NOT NULL UNIQUE,
            allowed_apps TEXT NOT NULL,
            custom_instructions TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_project_id ON agents(project_id);

        CREATE TABLE IF NOT EXISTS app_configurations (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            security_scheme TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            scheme_overrides TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(project_id, app_id)
        );

        CREATE TABLE IF NOT EXISTS linked_accounts (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            linked_account_owner_id TEXT NOT NULL,
            security_scheme TEXT NOT NULL,
            security_credentials TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            last_used_at TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(project_id, app_id, linked_account_owner_id)
        );
        CREATE INDEX IF NOT EXISTS idx_linked_accounts_project
            ON linked_accounts(project_id);
        CREATE INDEX IF NOT EXISTS idx_linked_accounts_project_app
            ON linked_accounts(project_id, app_id);
        CREATE INDEX IF NOT EXISTS idx_linked_accounts_project_created
            ON linked_accounts(project_id, created_at);

        CREATE TABLE IF NOT EXISTS triggers (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            linked_account_id TEXT NOT NULL REFERENCES linked_accounts(id) ON DELETE CASCADE,
            trigger_name TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            webhook_url TEXT NOT NULL,
            external_webhook_id TEXT,
            verification_token TEXT NOT NULL,
            config TEXT NOT NULL,
            status TEXT NOT NULL,
            last_triggered_at TEXT,
            expires_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_triggers_project ON triggers(project_id);
        CREATE INDEX IF NOT EXISTS idx_triggers_status ON triggers(status);
        CREATE INDEX IF NOT EXISTS idx_triggers_expires_at ON triggers(expires_at);

        CREATE TABLE IF NOT EXISTS trigger_events (
            id TEXT PRIMARY KEY,
            trigger_id TEXT NOT NULL REFERENCES triggers(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL,
            external_event_id TEXT,
            status TEXT NOT NULL,
            received_at TEXT NOT NULL,
            processed_at TEXT,
            delivered_at TEXT,
            expires_at TEXT NOT NULL,
            error_message TEXT,
            UNIQUE(trigger_id, external_event_id)
        );
        CREATE INDEX IF NOT EXISTS idx_trigger_events_trigger
            ON trigger_events(trigger_id);
        CREATE INDEX IF NOT EXISTS idx_trigger_events_status
            ON trigger_events(status);
        CREATE INDEX IF NOT EXISTS idx_trigger_events_expires_at
            ON trigger_events(expires_at);

        CREATE TABLE IF NOT EXISTS oauth1_temp_tokens (
            oauth_token TEXT PRIMARY KEY,
            state_jwt TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_oauth1_temp_tokens_expires_at
            ON oauth1_temp_tokens(expires_at);

        CREATE TABLE IF NOT EXISTS function_search_feedback (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            intent TEXT,
            returned_function_names TEXT NOT NULL,
            selected_function_name TEXT,
            was_helpful INTEGER NOT NULL,
            feedback_type TEXT NOT NULL,
            feedback_comment TEXT,
            search_metadata TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_feedback_agent_created
            ON function_search_feedback(agent_id, created_at);
        "#,
    )
}

// ── Shared row/column helpers ───────────────────────────────────────────────

/// Format a timestamp for storage. Fixed microsecond precision keeps the
/// TEXT column lexicographically ordered by time.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(column: &str, s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            column: column.into(),
            message: e.to_string(),
        })
}

pub(crate) fn parse_opt_ts(
    column: &str,
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|v| parse_ts(column, &v)).transpose()
}

pub(crate) fn parse_uuid(column: &str, s: &str) -> Result<uuid::Uuid, StoreError> {
    uuid::Uuid::parse_str(s).map_err(|e| StoreError::Corrupt {
        column: column.into(),
        message: e.to_string(),
    })
}

pub(crate) fn parse_json(column: &str, s: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Corrupt {
        column: column.into(),
        message: e.to_string(),
    })
}

pub(crate) fn corrupt(column: &str, message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        column: column.into(),
        message: message.into(),
    }
}

/// Serialize an embedding as a little-endian f32 BLOB.
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub(crate) fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Whether a rusqlite error is a UNIQUE-constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_bootstraps_schema() {
        let store = CatalogStore::open_in_memory().unwrap();
        let count: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(count >= 10);
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let embedding = vec![0.1f32, -2.5, 3.75, 0.0];
        let blob = embedding_to_blob(&embedding);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_embedding(&blob), embedding);
    }

    #[test]
    fn test_fmt_ts_sorts_lexicographically() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(fmt_ts(earlier) < fmt_ts(later));
    }

    #[test]
    fn test_parse_ts_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts("created_at", &fmt_ts(now)).unwrap();
        assert!((parsed - now).num_microseconds().unwrap().abs() < 2);
    }
}
