//! Attempt operations.
//!
//! Attempts are append-only history: `attempt_index` is monotonic per task
//! starting at 1, and a terminal attempt can never be modified again apart
//! from reason appends.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use matterstack_core::{generate_attempt_id, AttemptStatus};

use crate::records::AttemptRecord;
use crate::store::{ms_to_datetime, now_ms, StateStore, StoreError};

/// Fields for a freshly created attempt.
#[derive(Clone, Debug, Default)]
pub struct NewAttempt {
    pub operator_key: Option<String>,
    pub operator_type: Option<String>,
    pub operator_data: Option<Value>,
    pub evidence_path: Option<String>,
    pub workdir_remote: Option<String>,
    pub config_hash: Option<String>,
    pub config_files: Option<Value>,
}

/// Partial update applied to a non-terminal attempt.
#[derive(Clone, Debug, Default)]
pub struct AttemptUpdate {
    pub status: Option<AttemptStatus>,
    pub operator_key: Option<String>,
    pub operator_type: Option<String>,
    pub external_id: Option<String>,
    pub operator_data: Option<Value>,
    pub evidence_path: Option<String>,
    pub workdir_remote: Option<String>,
    pub config_hash: Option<String>,
    pub config_files: Option<Value>,
    pub status_reason: Option<String>,
}

impl AttemptUpdate {
    pub fn status(status: AttemptStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    pub fn with_operator_data(mut self, data: Value) -> Self {
        self.operator_data = Some(data);
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }
}

const ATTEMPT_COLUMNS: &str = "attempt_id, task_id, run_id, attempt_index, status, operator_key,
     operator_type, external_id, operator_data, evidence_path, workdir_remote,
     config_hash, config_files, created_at_ms, submitted_at_ms, ended_at_ms, status_reason";

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<AttemptRecord> {
    let status: String = row.get(4)?;
    let operator_data: String = row.get(8)?;
    let config_files: Option<String> = row.get(12)?;

    let decode = |what: &str, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("{what}: {e}").into(),
        )
    };
    let bad_status = || {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown attempt status {status:?}").into(),
        )
    };

    Ok(AttemptRecord {
        attempt_id: row.get(0)?,
        task_id: row.get(1)?,
        run_id: row.get(2)?,
        attempt_index: row.get(3)?,
        status: AttemptStatus::parse(&status).ok_or_else(bad_status)?,
        operator_key: row.get(5)?,
        operator_type: row.get(6)?,
        external_id: row.get(7)?,
        operator_data: serde_json::from_str(&operator_data)
            .map_err(|e| decode("operator_data", e))?,
        evidence_path: row.get(9)?,
        workdir_remote: row.get(10)?,
        config_hash: row.get(11)?,
        config_files: config_files
            .map(|raw| serde_json::from_str(&raw).map_err(|e| decode("config_files", e)))
            .transpose()?,
        created_at: row.get::<_, Option<i64>>(13)?.map(ms_to_datetime),
        submitted_at: row.get::<_, Option<i64>>(14)?.map(ms_to_datetime),
        ended_at: row.get::<_, Option<i64>>(15)?.map(ms_to_datetime),
        status_reason: row.get(16)?,
    })
}

impl StateStore {
    /// Create a new attempt with the next monotonic index and point the task
    /// at it. The whole operation is one transaction.
    pub fn create_attempt(
        &self,
        run_id: &str,
        task_id: &str,
        new: NewAttempt,
    ) -> Result<String, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let task_exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM tasks WHERE task_id = ?1 AND run_id = ?2",
                params![task_id, run_id],
                |row| row.get(0),
            )
            .optional()?;
        if task_exists.is_none() {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }

        let max_index: Option<u32> = tx.query_row(
            "SELECT MAX(attempt_index) FROM task_attempts WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        let next_index = max_index.unwrap_or(0) + 1;
        let attempt_id = generate_attempt_id();

        tx.execute(
            "INSERT INTO task_attempts
                (attempt_id, task_id, run_id, attempt_index, status, operator_key,
                 operator_type, operator_data, evidence_path, workdir_remote,
                 config_hash, config_files, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                attempt_id,
                task_id,
                run_id,
                next_index,
                AttemptStatus::Created.as_str(),
                new.operator_key,
                new.operator_type,
                serde_json::to_string(&new.operator_data.unwrap_or_else(|| Value::Object(Default::default())))?,
                new.evidence_path,
                new.workdir_remote,
                new.config_hash,
                new.config_files.map(|v| serde_json::to_string(&v)).transpose()?,
                now_ms(),
            ],
        )?;
        tx.execute(
            "UPDATE tasks SET current_attempt_id = ?2 WHERE task_id = ?1",
            params![task_id, attempt_id],
        )?;
        tx.commit()?;
        Ok(attempt_id)
    }

    /// All attempts of a task in chronological (`attempt_index`) order.
    pub fn list_attempts(&self, task_id: &str) -> Result<Vec<AttemptRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM task_attempts
             WHERE task_id = ?1 ORDER BY attempt_index ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], attempt_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn get_attempt(&self, attempt_id: &str) -> Result<Option<AttemptRecord>, StoreError> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {ATTEMPT_COLUMNS} FROM task_attempts WHERE attempt_id = ?1"),
            params![attempt_id],
            attempt_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// The attempt pointed at by `tasks.current_attempt_id`.
    pub fn get_current_attempt(
        &self,
        task_id: &str,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        let attempt_id: Option<String> = {
            let conn = self.connection()?;
            conn.query_row(
                "SELECT current_attempt_id FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten()
        };
        match attempt_id {
            Some(id) => self.get_attempt(&id),
            None => Ok(None),
        }
    }

    /// Attempts in a non-terminal status.
    pub fn get_active_attempts(&self, run_id: &str) -> Result<Vec<AttemptRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM task_attempts
             WHERE run_id = ?1
               AND status NOT IN ('COMPLETED', 'FAILED', 'FAILED_INIT', 'CANCELLED')
             ORDER BY attempt_id"
        ))?;
        let rows = stmt.query_map(params![run_id], attempt_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Active attempt counts grouped by operator key (None keys under "").
    pub fn count_active_attempts_by_operator(
        &self,
        run_id: &str,
    ) -> Result<BTreeMap<String, usize>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT operator_key, COUNT(*) FROM task_attempts
             WHERE run_id = ?1
               AND status NOT IN ('COMPLETED', 'FAILED', 'FAILED_INIT', 'CANCELLED')
             GROUP BY operator_key",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, count) = row?;
            out.insert(key.unwrap_or_default(), count as usize);
        }
        Ok(out)
    }

    /// Task ids with an attempt in a non-terminal status.
    pub fn attempt_active_task_ids(&self, run_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT task_id FROM task_attempts
             WHERE run_id = ?1
               AND status NOT IN ('COMPLETED', 'FAILED', 'FAILED_INIT', 'CANCELLED')",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<BTreeSet<_>, _>>().map_err(Into::into)
    }

    /// Task ids that have at least one attempt in this run.
    pub fn attempt_task_ids(&self, run_id: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT task_id FROM task_attempts WHERE run_id = ?1")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<BTreeSet<_>, _>>().map_err(Into::into)
    }

    /// Apply a partial update to a non-terminal attempt.
    ///
    /// Terminal attempts are immutable; use [`StateStore::append_attempt_reason`]
    /// for the one permitted mutation. Timestamps follow the transition: the
    /// first move out of CREATED stamps `submitted_at`, the move into a
    /// terminal status stamps `ended_at`.
    pub fn update_attempt(
        &self,
        attempt_id: &str,
        update: AttemptUpdate,
    ) -> Result<(), StoreError> {
        let current = self
            .get_attempt(attempt_id)?
            .ok_or_else(|| StoreError::AttemptNotFound(attempt_id.to_string()))?;
        if current.status.is_terminal() {
            return Err(StoreError::TerminalAttempt(attempt_id.to_string()));
        }

        let new_status = update.status.unwrap_or(current.status);
        let now = now_ms();
        let entered_flight = matches!(
            new_status,
            AttemptStatus::Submitted
                | AttemptStatus::Running
                | AttemptStatus::WaitingExternal
                | AttemptStatus::Completed
        );
        let submitted_at_ms: Option<i64> = match (current.submitted_at, entered_flight) {
            (Some(at), _) => Some(at.timestamp_millis()),
            (None, true) => Some(now),
            (None, false) => None,
        };
        let ended_at_ms: Option<i64> = if new_status.is_terminal() {
            Some(now)
        } else {
            None
        };

        let conn = self.connection()?;
        conn.execute(
            "UPDATE task_attempts SET
                status = ?2,
                operator_key = COALESCE(?3, operator_key),
                operator_type = COALESCE(?4, operator_type),
                external_id = COALESCE(?5, external_id),
                operator_data = COALESCE(?6, operator_data),
                evidence_path = COALESCE(?7, evidence_path),
                workdir_remote = COALESCE(?8, workdir_remote),
                config_hash = COALESCE(?9, config_hash),
                config_files = COALESCE(?10, config_files),
                status_reason = COALESCE(?11, status_reason),
                submitted_at_ms = ?12,
                ended_at_ms = ?13
             WHERE attempt_id = ?1",
            params![
                attempt_id,
                new_status.as_str(),
                update.operator_key,
                update.operator_type,
                update.external_id,
                update
                    .operator_data
                    .map(|v| serde_json::to_string(&v))
                    .transpose()?,
                update.evidence_path,
                update.workdir_remote,
                update.config_hash,
                update
                    .config_files
                    .map(|v| serde_json::to_string(&v))
                    .transpose()?,
                update.status_reason,
                submitted_at_ms,
                ended_at_ms,
            ],
        )?;
        Ok(())
    }

    /// Append to a terminal attempt's status reason; the only mutation a
    /// terminal attempt permits.
    pub fn append_attempt_reason(
        &self,
        attempt_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let current = self
            .get_attempt(attempt_id)?
            .ok_or_else(|| StoreError::AttemptNotFound(attempt_id.to_string()))?;
        let combined = match current.status_reason {
            Some(existing) if !existing.is_empty() => format!("{existing}; {reason}"),
            _ => reason.to_string(),
        };
        let conn = self.connection()?;
        conn.execute(
            "UPDATE task_attempts SET status_reason = ?2 WHERE attempt_id = ?1",
            params![attempt_id, combined],
        )?;
        Ok(())
    }

    /// Attempts stuck in CREATED with no external id older than the cutoff.
    pub fn find_orphaned_attempts(
        &self,
        run_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM task_attempts
             WHERE run_id = ?1
               AND status = 'CREATED'
               AND external_id IS NULL
               AND created_at_ms < ?2
             ORDER BY attempt_id"
        ))?;
        let rows = stmt.query_map(params![run_id, cutoff.timestamp_millis()], attempt_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matterstack_core::{RunHandle, RunStatus, Task, Workflow};
    use serde_json::json;

    fn seeded() -> (tempfile::TempDir, StateStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let handle = RunHandle::new("ws", "20240101_000000_cccc0000", dir.path());
        let store = StateStore::open(handle.db_path()).unwrap();
        store
            .create_run(&handle, RunStatus::Running, json!({}), None)
            .unwrap();
        let mut wf = Workflow::new();
        wf.add_task(Task::new("echo t1").with_id("t1")).unwrap();
        store.add_workflow(&wf, &handle.run_id).unwrap();
        (dir, store, handle.run_id)
    }

    #[test]
    fn attempt_index_is_monotonic_from_one() {
        let (_dir, store, run_id) = seeded();
        let a1 = store
            .create_attempt(&run_id, "t1", NewAttempt::default())
            .unwrap();
        let a2 = store
            .create_attempt(&run_id, "t1", NewAttempt::default())
            .unwrap();

        let attempts = store.list_attempts("t1").unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_index, 1);
        assert_eq!(attempts[1].attempt_index, 2);
        assert_eq!(attempts[0].attempt_id, a1);
        assert_eq!(attempts[1].attempt_id, a2);

        // The task pointer follows the newest attempt.
        let current = store.get_current_attempt("t1").unwrap().unwrap();
        assert_eq!(current.attempt_id, a2);
    }

    #[test]
    fn create_attempt_requires_existing_task() {
        let (_dir, store, run_id) = seeded();
        let err = store.create_attempt(&run_id, "ghost", NewAttempt::default());
        assert!(matches!(err, Err(StoreError::TaskNotFound(_))));
    }

    #[test]
    fn terminal_attempts_are_immutable() {
        let (_dir, store, run_id) = seeded();
        let id = store
            .create_attempt(&run_id, "t1", NewAttempt::default())
            .unwrap();
        store
            .update_attempt(
                &id,
                AttemptUpdate::status(AttemptStatus::Failed).with_reason("exit 1"),
            )
            .unwrap();

        let err = store.update_attempt(&id, AttemptUpdate::status(AttemptStatus::Running));
        assert!(matches!(err, Err(StoreError::TerminalAttempt(_))));

        // Reason appends remain allowed.
        store.append_attempt_reason(&id, "retried by operator").unwrap();
        let attempt = store.get_attempt(&id).unwrap().unwrap();
        assert_eq!(
            attempt.status_reason.as_deref(),
            Some("exit 1; retried by operator")
        );
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert!(attempt.ended_at.is_some());
    }

    #[test]
    fn timestamps_follow_transitions() {
        let (_dir, store, run_id) = seeded();
        let id = store
            .create_attempt(&run_id, "t1", NewAttempt::default())
            .unwrap();
        let created = store.get_attempt(&id).unwrap().unwrap();
        assert!(created.created_at.is_some());
        assert!(created.submitted_at.is_none());

        store
            .update_attempt(
                &id,
                AttemptUpdate::status(AttemptStatus::Submitted).with_external_id("job-7"),
            )
            .unwrap();
        let submitted = store.get_attempt(&id).unwrap().unwrap();
        assert!(submitted.submitted_at.is_some());
        assert!(submitted.ended_at.is_none());
        assert_eq!(submitted.external_id.as_deref(), Some("job-7"));
    }

    #[test]
    fn active_attempts_and_operator_counts() {
        let (_dir, store, run_id) = seeded();
        let mut wf = Workflow::new();
        wf.add_task(Task::new("echo t2").with_id("t2")).unwrap();
        store.add_workflow(&wf, &run_id).unwrap();

        let a1 = store
            .create_attempt(
                &run_id,
                "t1",
                NewAttempt {
                    operator_key: Some("local.default".into()),
                    ..NewAttempt::default()
                },
            )
            .unwrap();
        let a2 = store
            .create_attempt(
                &run_id,
                "t2",
                NewAttempt {
                    operator_key: Some("hpc.default".into()),
                    ..NewAttempt::default()
                },
            )
            .unwrap();

        assert_eq!(store.get_active_attempts(&run_id).unwrap().len(), 2);
        let counts = store.count_active_attempts_by_operator(&run_id).unwrap();
        assert_eq!(counts.get("local.default"), Some(&1));
        assert_eq!(counts.get("hpc.default"), Some(&1));

        store
            .update_attempt(&a1, AttemptUpdate::status(AttemptStatus::Completed))
            .unwrap();
        assert_eq!(store.get_active_attempts(&run_id).unwrap().len(), 1);
        assert_eq!(
            store.get_active_attempts(&run_id).unwrap()[0].attempt_id,
            a2
        );
    }

    #[test]
    fn orphan_detection_honors_cutoff() {
        let (_dir, store, run_id) = seeded();
        store
            .create_attempt(&run_id, "t1", NewAttempt::default())
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(10);
        let orphans = store.find_orphaned_attempts(&run_id, future).unwrap();
        assert_eq!(orphans.len(), 1);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(store.find_orphaned_attempts(&run_id, past).unwrap().is_empty());
    }
}
