//! Store handle, connection management, and error type.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;

use matterstack_core::EngineError;

use crate::schema;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),
    #[error("json error: {0}")]
    Json(String),
    #[error("unsupported schema version {found} (supported up to {supported})")]
    SchemaVersion { found: i64, supported: i64 },
    #[error("run lock is held{}", .holder.as_ref().map(|h| format!(" by {h}")).unwrap_or_default())]
    LockHeld { holder: Option<String> },
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("attempt {0} not found")]
    AttemptNotFound(String),
    #[error("attempt {0} is terminal and cannot be modified")]
    TerminalAttempt(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Json(err.to_string())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SchemaVersion { found, supported } => {
                EngineError::SchemaVersion { found, supported }
            }
            StoreError::LockHeld { holder } => EngineError::LockHeld { holder },
            StoreError::RunNotFound(id) => EngineError::RunNotFound(id),
            StoreError::TaskNotFound(id) => EngineError::TaskNotFound(id),
            StoreError::AttemptNotFound(id) => EngineError::AttemptNotFound(id),
            StoreError::TerminalAttempt(id) => EngineError::TerminalAttempt(id),
            other => EngineError::Storage(other.to_string()),
        }
    }
}

/// Persistence layer for one run.
///
/// Cheap to clone; all clones share one connection. Opening verifies the
/// schema version and applies any missing migrations (additive only); a
/// database from a newer build refuses to open.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl StateStore {
    /// Open (or create) the store at `db_path`, migrating as needed.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        {
            let mut guard = store.connection()?;
            schema::ensure_schema(&mut guard)?;
        }
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Lock file path: `run.lock` next to the database.
    pub fn lock_path(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(|p| p.join("run.lock"))
            .unwrap_or_else(|| PathBuf::from("run.lock"))
    }

    /// Acquire the exclusive run lock. The returned handle releases on drop.
    pub fn lock(&self) -> Result<crate::lock::RunLock, StoreError> {
        crate::lock::RunLock::acquire(&self.lock_path())
    }

    pub(crate) fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Sqlite("connection mutex poisoned".to_string()))
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn ms_to_datetime(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
