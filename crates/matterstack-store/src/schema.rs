//! Schema definition and additive migrations.
//!
//! The chain is v1 -> v2 -> v3 -> v4. Each step only adds tables, columns,
//! or indexes and back-fills deterministically from prior data, so migrating
//! a database twice (or on two machines) yields identical rows. A database
//! carrying a version newer than [`CURRENT_SCHEMA_VERSION`] refuses to open.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::info;

use matterstack_core::legacy_operator_type_to_key;

use crate::store::StoreError;

pub const CURRENT_SCHEMA_VERSION: i64 = 4;

pub(crate) fn ensure_schema(conn: &mut Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let current = current_version(conn)?;
    if current > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found: current,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        apply_v1(conn)?;
        record_version(conn, 1)?;
    }
    if current < 2 {
        apply_v2(conn)?;
        record_version(conn, 2)?;
    }
    if current < 3 {
        apply_v3(conn)?;
        record_version(conn, 3)?;
    }
    if current < 4 {
        apply_v4(conn)?;
        record_version(conn, 4)?;
    }
    Ok(())
}

pub(crate) fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| StoreError::Sqlite(format!("malformed schema version: {v:?}"))),
        None => Ok(0),
    }
}

fn record_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO schema_info (key, value) VALUES ('version', ?1)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

/// v1 baseline: runs, tasks, legacy external_runs, audit events.
fn apply_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            workspace_slug TEXT NOT NULL,
            root_path TEXT NOT NULL,
            status TEXT NOT NULL,
            status_reason TEXT,
            tags TEXT NOT NULL DEFAULT '{}',
            description TEXT,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs (run_id),
            command TEXT NOT NULL,
            files TEXT NOT NULL DEFAULT '{}',
            env TEXT NOT NULL DEFAULT '{}',
            dependencies TEXT NOT NULL DEFAULT '[]',
            cores INTEGER NOT NULL DEFAULT 1,
            memory_gb INTEGER NOT NULL DEFAULT 1,
            gpus INTEGER NOT NULL DEFAULT 0,
            time_limit_minutes INTEGER NOT NULL DEFAULT 60,
            allow_dependency_failure INTEGER NOT NULL DEFAULT 0,
            allow_failure INTEGER NOT NULL DEFAULT 0,
            download_patterns TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING'
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks (run_id);

        CREATE TABLE IF NOT EXISTS external_runs (
            task_id TEXT PRIMARY KEY REFERENCES tasks (task_id),
            run_id TEXT NOT NULL REFERENCES runs (run_id),
            operator_type TEXT NOT NULL,
            external_id TEXT,
            status TEXT NOT NULL,
            operator_data TEXT NOT NULL DEFAULT '{}',
            relative_path TEXT
        );

        CREATE TABLE IF NOT EXISTS run_events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES runs (run_id),
            at_ms INTEGER NOT NULL,
            action TEXT NOT NULL,
            actor TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events (run_id);
        ",
    )?;
    Ok(())
}

/// v2: first-class attempts; one attempt back-filled per legacy external run.
fn apply_v2(conn: &Connection) -> Result<(), StoreError> {
    info!("migrating state store schema v1 -> v2");
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task_attempts (
            attempt_id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks (task_id),
            run_id TEXT NOT NULL REFERENCES runs (run_id),
            attempt_index INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            operator_type TEXT,
            external_id TEXT,
            operator_data TEXT NOT NULL DEFAULT '{}',
            evidence_path TEXT,
            workdir_remote TEXT,
            config_hash TEXT,
            config_files TEXT,
            created_at_ms INTEGER,
            submitted_at_ms INTEGER,
            ended_at_ms INTEGER,
            status_reason TEXT,
            UNIQUE (task_id, attempt_index)
        );
        CREATE INDEX IF NOT EXISTS idx_task_attempts_task ON task_attempts (task_id);
        CREATE INDEX IF NOT EXISTS idx_task_attempts_run_status ON task_attempts (run_id, status);
        ",
    )?;

    if !table_has_column(conn, "tasks", "current_attempt_id")? {
        conn.execute("ALTER TABLE tasks ADD COLUMN current_attempt_id TEXT", [])?;
    }

    // Backfill: one attempt per legacy external run, with a deterministic id
    // so repeated migration of the same v1 database yields identical rows.
    let rows: Vec<(String, String, String, Option<String>, String, String, Option<String>)> = {
        let mut stmt = conn.prepare(
            "SELECT er.task_id, er.run_id, er.operator_type, er.external_id,
                    er.status, er.operator_data, er.relative_path
             FROM external_runs er
             ORDER BY er.task_id",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?;
        mapped.collect::<Result<_, _>>()?
    };

    for (task_id, run_id, operator_type, external_id, status, operator_data, relative_path) in rows
    {
        let attempt_id = migration_attempt_id(&run_id, &task_id);
        let created_at_ms: Option<i64> = conn
            .query_row(
                "SELECT created_at_ms FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        conn.execute(
            "INSERT OR IGNORE INTO task_attempts
                (attempt_id, task_id, run_id, attempt_index, status, operator_type,
                 external_id, operator_data, evidence_path, created_at_ms)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt_id,
                task_id,
                run_id,
                status,
                operator_type,
                external_id,
                operator_data,
                relative_path,
                created_at_ms,
            ],
        )?;
        conn.execute(
            "UPDATE tasks SET current_attempt_id = ?2 WHERE task_id = ?1",
            params![task_id, attempt_id],
        )?;
    }
    Ok(())
}

/// v3: canonical routing key on attempts, back-filled from operator_data,
/// then the legacy operator-type map, else NULL.
fn apply_v3(conn: &Connection) -> Result<(), StoreError> {
    info!("migrating state store schema v2 -> v3");
    if !table_has_column(conn, "task_attempts", "operator_key")? {
        conn.execute("ALTER TABLE task_attempts ADD COLUMN operator_key TEXT", [])?;
    }

    let rows: Vec<(String, Option<String>, String)> = {
        let mut stmt = conn.prepare(
            "SELECT attempt_id, operator_type, operator_data
             FROM task_attempts WHERE operator_key IS NULL",
        )?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        mapped.collect::<Result<_, _>>()?
    };

    for (attempt_id, operator_type, operator_data) in rows {
        let from_data = serde_json::from_str::<serde_json::Value>(&operator_data)
            .ok()
            .and_then(|v| {
                v.get("operator_key")
                    .and_then(|k| k.as_str())
                    .map(str::to_string)
            });
        let key = from_data
            .or_else(|| operator_type.as_deref().and_then(legacy_operator_type_to_key));
        if let Some(key) = key {
            conn.execute(
                "UPDATE task_attempts SET operator_key = ?2 WHERE attempt_id = ?1",
                params![attempt_id, key],
            )?;
        }
    }
    Ok(())
}

/// v4: first-class routing key on tasks.
fn apply_v4(conn: &Connection) -> Result<(), StoreError> {
    info!("migrating state store schema v3 -> v4");
    if !table_has_column(conn, "tasks", "operator_key")? {
        conn.execute("ALTER TABLE tasks ADD COLUMN operator_key TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Deterministic attempt id for the v1 -> v2 backfill.
fn migration_attempt_id(run_id: &str, task_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b":");
    hasher.update(task_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("migrated_{hex}")
}
