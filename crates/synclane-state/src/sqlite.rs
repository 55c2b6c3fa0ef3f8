//! `SQLite`-backed implementation of [`SyncPersistence`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection};
use synclane_types::{ReplicationOutput, StateMessage, StateType};
use uuid::Uuid;

use crate::backend::SyncPersistence;
use crate::error::{self, StateError};

/// Idempotent DDL for persistence tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS connection_checkpoints (
    connection_id TEXT NOT NULL,
    stream_namespace TEXT NOT NULL,
    stream_name TEXT NOT NULL,
    state_type TEXT NOT NULL,
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (connection_id, stream_namespace, stream_name)
);

CREATE TABLE IF NOT EXISTS sync_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id TEXT NOT NULL,
    job_id INTEGER NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    records_synced INTEGER NOT NULL,
    bytes_synced INTEGER NOT NULL,
    output_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_attempts_connection ON sync_attempts (connection_id, job_id);
";

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteSyncPersistence::open`] for file-backed persistence
/// or [`SqliteSyncPersistence::in_memory`] for tests.
pub struct SqliteSyncPersistence {
    conn: Mutex<Connection>,
}

impl SqliteSyncPersistence {
    /// Open or create a `SQLite` database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Row key for a checkpoint. Global and legacy checkpoints cover the
    /// whole connection and share the empty key.
    fn checkpoint_key(state: &StateMessage) -> (String, String) {
        match (state.state_type, state.stream_descriptor()) {
            (StateType::Stream, Some(desc)) => (
                desc.namespace.clone().unwrap_or_default(),
                desc.name.clone(),
            ),
            _ => (String::new(), String::new()),
        }
    }

    #[cfg(test)]
    fn attempt_count(&self, connection_id: Uuid) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sync_attempts WHERE connection_id = ?1",
            [connection_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl SyncPersistence for SqliteSyncPersistence {
    fn persist(&self, connection_id: Uuid, state: &StateMessage) -> error::Result<()> {
        let (namespace, name) = Self::checkpoint_key(state);
        let json = serde_json::to_string(state)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO connection_checkpoints
                 (connection_id, stream_namespace, stream_name, state_type, state_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (connection_id, stream_namespace, stream_name)
             DO UPDATE SET state_type = excluded.state_type,
                           state_json = excluded.state_json,
                           updated_at = excluded.updated_at",
            params![
                connection_id.to_string(),
                namespace,
                name,
                state.state_type.as_str(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::debug!(
            connection_id = %connection_id,
            state_type = state.state_type.as_str(),
            stream = %name,
            "Persisted checkpoint"
        );
        Ok(())
    }

    fn latest_checkpoints(&self, connection_id: Uuid) -> error::Result<Vec<StateMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT state_json FROM connection_checkpoints
             WHERE connection_id = ?1
             ORDER BY stream_namespace, stream_name",
        )?;
        let rows = stmt.query_map([connection_id.to_string()], |row| row.get::<_, String>(0))?;

        let mut states = Vec::new();
        for raw in rows {
            states.push(serde_json::from_str(&raw?)?);
        }
        Ok(states)
    }

    fn record_attempt(
        &self,
        connection_id: Uuid,
        job_id: i64,
        attempt: u32,
        output: &ReplicationOutput,
    ) -> error::Result<()> {
        let summary = &output.replication_attempt_summary;
        let json = serde_json::to_string(output)?;
        let conn = self.lock_conn()?;
        #[allow(clippy::cast_possible_wrap)]
        conn.execute(
            "INSERT INTO sync_attempts
                 (connection_id, job_id, attempt, status, records_synced, bytes_synced, output_json, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                connection_id.to_string(),
                job_id,
                attempt,
                summary.status.as_str(),
                summary.records_synced as i64,
                summary.bytes_synced as i64,
                json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use synclane_types::{
        ConfiguredCatalog, ReplicationAttemptSummary, ReplicationStatus, StreamDescriptor,
        SyncStats,
    };

    fn output(status: ReplicationStatus) -> ReplicationOutput {
        ReplicationOutput {
            replication_attempt_summary: ReplicationAttemptSummary {
                status,
                records_synced: 3,
                bytes_synced: 30,
                start_time: 0,
                end_time: 10,
                total_stats: SyncStats::default(),
                stream_stats: vec![],
                performance_metrics: None,
            },
            output_catalog: ConfiguredCatalog::default(),
            failures: vec![],
        }
    }

    #[test]
    fn persist_and_read_stream_checkpoint() {
        let store = SqliteSyncPersistence::in_memory().unwrap();
        let conn_id = Uuid::new_v4();
        let state = StateMessage::for_stream(StreamDescriptor::new("users"), json!({"cursor": 1}));

        store.persist(conn_id, &state).unwrap();

        let latest = store.latest_checkpoints(conn_id).unwrap();
        assert_eq!(latest, vec![state]);
    }

    #[test]
    fn persist_upserts_per_stream() {
        let store = SqliteSyncPersistence::in_memory().unwrap();
        let conn_id = Uuid::new_v4();
        let users = StreamDescriptor::new("users");
        let orders = StreamDescriptor::new("orders").with_namespace("shop");

        store
            .persist(conn_id, &StateMessage::for_stream(users.clone(), json!({"cursor": 1})))
            .unwrap();
        store
            .persist(conn_id, &StateMessage::for_stream(orders, json!({"cursor": 9})))
            .unwrap();
        store
            .persist(conn_id, &StateMessage::for_stream(users, json!({"cursor": 2})))
            .unwrap();

        let latest = store.latest_checkpoints(conn_id).unwrap();
        assert_eq!(latest.len(), 2);
        let users_state = latest
            .iter()
            .find(|s| s.stream_descriptor().is_some_and(|d| d.name == "users"))
            .unwrap();
        assert_eq!(
            users_state.stream.as_ref().unwrap().stream_state,
            Some(json!({"cursor": 2}))
        );
    }

    #[test]
    fn global_checkpoint_replaces_previous_global() {
        let store = SqliteSyncPersistence::in_memory().unwrap();
        let conn_id = Uuid::new_v4();

        store
            .persist(conn_id, &StateMessage::global(json!({"lsn": 1}), vec![]))
            .unwrap();
        store
            .persist(conn_id, &StateMessage::global(json!({"lsn": 2}), vec![]))
            .unwrap();

        let latest = store.latest_checkpoints(conn_id).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(
            latest[0].global.as_ref().unwrap().shared_state,
            Some(json!({"lsn": 2}))
        );
    }

    #[test]
    fn connections_are_isolated() {
        let store = SqliteSyncPersistence::in_memory().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.persist(a, &StateMessage::legacy(json!({"x": 1}))).unwrap();

        assert_eq!(store.latest_checkpoints(a).unwrap().len(), 1);
        assert!(store.latest_checkpoints(b).unwrap().is_empty());
    }

    #[test]
    fn record_attempt_appends_history() {
        let store = SqliteSyncPersistence::in_memory().unwrap();
        let conn_id = Uuid::new_v4();
        store
            .record_attempt(conn_id, 1, 0, &output(ReplicationStatus::Failed))
            .unwrap();
        store
            .record_attempt(conn_id, 1, 1, &output(ReplicationStatus::Completed))
            .unwrap();
        assert_eq!(store.attempt_count(conn_id).unwrap(), 2);
    }

    #[test]
    fn open_creates_file_and_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let conn_id = Uuid::new_v4();
        {
            let store = SqliteSyncPersistence::open(&path).unwrap();
            store.persist(conn_id, &StateMessage::legacy(json!({"x": 1}))).unwrap();
        }
        assert!(path.exists());

        let reopened = SqliteSyncPersistence::open(&path).unwrap();
        assert_eq!(reopened.latest_checkpoints(conn_id).unwrap().len(), 1);
    }
}
