//! Legacy external-run operations (schema v1).
//!
//! Retained for databases created before the attempt model existed. The
//! poller consults these rows only for tasks that have no attempts.

use rusqlite::{params, OptionalExtension, Row};

use matterstack_core::AttemptStatus;

use crate::records::ExternalRunRecord;
use crate::store::{StateStore, StoreError};

fn external_from_row(row: &Row<'_>) -> rusqlite::Result<ExternalRunRecord> {
    let status: String = row.get(4)?;
    let operator_data: String = row.get(5)?;
    let bad = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
    };
    Ok(ExternalRunRecord {
        task_id: row.get(0)?,
        run_id: row.get(1)?,
        operator_type: row.get(2)?,
        external_id: row.get(3)?,
        status: AttemptStatus::parse(&status)
            .ok_or_else(|| bad(format!("unknown external run status {status:?}")))?,
        operator_data: serde_json::from_str(&operator_data)
            .map_err(|e| bad(format!("operator_data: {e}")))?,
        relative_path: row.get(6)?,
    })
}

const EXTERNAL_COLUMNS: &str =
    "task_id, run_id, operator_type, external_id, status, operator_data, relative_path";

impl StateStore {
    /// Upsert a legacy external-run row (one per task).
    pub fn register_external_run(&self, record: &ExternalRunRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO external_runs
                (task_id, run_id, operator_type, external_id, status, operator_data, relative_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (task_id) DO UPDATE SET
                operator_type = excluded.operator_type,
                external_id = excluded.external_id,
                status = excluded.status,
                operator_data = excluded.operator_data,
                relative_path = excluded.relative_path",
            params![
                record.task_id,
                record.run_id,
                record.operator_type,
                record.external_id,
                record.status.as_str(),
                serde_json::to_string(&record.operator_data)?,
                record.relative_path,
            ],
        )?;
        Ok(())
    }

    pub fn get_external_run(
        &self,
        task_id: &str,
    ) -> Result<Option<ExternalRunRecord>, StoreError> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("SELECT {EXTERNAL_COLUMNS} FROM external_runs WHERE task_id = ?1"),
            params![task_id],
            external_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Legacy rows in a non-terminal status.
    pub fn get_active_external_runs(
        &self,
        run_id: &str,
    ) -> Result<Vec<ExternalRunRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXTERNAL_COLUMNS} FROM external_runs
             WHERE run_id = ?1
               AND status NOT IN ('COMPLETED', 'FAILED', 'FAILED_INIT', 'CANCELLED')
             ORDER BY task_id"
        ))?;
        let rows = stmt.query_map(params![run_id], external_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn update_external_run(&self, record: &ExternalRunRecord) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE external_runs SET
                external_id = ?2, status = ?3, operator_data = ?4, relative_path = ?5
             WHERE task_id = ?1",
            params![
                record.task_id,
                record.external_id,
                record.status.as_str(),
                serde_json::to_string(&record.operator_data)?,
                record.relative_path,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::TaskNotFound(record.task_id.clone()));
        }
        Ok(())
    }

    /// Mark any active legacy rows for a task CANCELLED.
    pub fn cancel_external_runs(&self, task_id: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE external_runs SET status = 'CANCELLED'
             WHERE task_id = ?1
               AND status IN ('CREATED', 'SUBMITTED', 'RUNNING', 'WAITING_EXTERNAL')",
            params![task_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matterstack_core::{RunHandle, RunStatus, Task, Workflow};
    use serde_json::json;

    #[test]
    fn legacy_rows_round_trip_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let handle = RunHandle::new("ws", "20240101_000000_dddd0000", dir.path());
        let store = StateStore::open(handle.db_path()).unwrap();
        store
            .create_run(&handle, RunStatus::Running, json!({}), None)
            .unwrap();
        let mut wf = Workflow::new();
        wf.add_task(Task::new("echo t1").with_id("t1")).unwrap();
        store.add_workflow(&wf, &handle.run_id).unwrap();

        let record = ExternalRunRecord {
            task_id: "t1".into(),
            run_id: handle.run_id.clone(),
            operator_type: "HPC".into(),
            external_id: Some("slurm-42".into()),
            status: AttemptStatus::Running,
            operator_data: json!({"partition": "batch"}),
            relative_path: Some("operators/hpc/abc".into()),
        };
        store.register_external_run(&record).unwrap();

        let active = store.get_active_external_runs(&handle.run_id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_id.as_deref(), Some("slurm-42"));

        store.cancel_external_runs("t1").unwrap();
        assert!(store
            .get_active_external_runs(&handle.run_id)
            .unwrap()
            .is_empty());
        assert_eq!(
            store.get_external_run("t1").unwrap().unwrap().status,
            AttemptStatus::Cancelled
        );
    }
}
