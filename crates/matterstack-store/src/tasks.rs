//! Task operations.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{params, OptionalExtension, Row};

use matterstack_core::workflow::{DownloadPatterns, FileInput};
use matterstack_core::{Task, TaskStatus, Workflow};

use crate::records::TaskRow;
use crate::store::{StateStore, StoreError};

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<(Task, String, Option<String>)> {
    let task_id: String = row.get(0)?;
    let command: String = row.get(1)?;
    let files: String = row.get(2)?;
    let env: String = row.get(3)?;
    let dependencies: String = row.get(4)?;
    let cores: u32 = row.get(5)?;
    let memory_gb: u32 = row.get(6)?;
    let gpus: u32 = row.get(7)?;
    let time_limit_minutes: u32 = row.get(8)?;
    let allow_dependency_failure: bool = row.get(9)?;
    let allow_failure: bool = row.get(10)?;
    let download_patterns: Option<String> = row.get(11)?;
    let status: String = row.get(12)?;
    let operator_key: Option<String> = row.get(13)?;
    let current_attempt_id: Option<String> = row.get(14)?;

    let decode = |what: &str, e: serde_json::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("{what}: {e}").into(),
        )
    };

    let files: BTreeMap<String, FileInput> =
        serde_json::from_str(&files).map_err(|e| decode("task files", e))?;
    let env: BTreeMap<String, String> =
        serde_json::from_str(&env).map_err(|e| decode("task env", e))?;
    let dependencies: BTreeSet<String> =
        serde_json::from_str(&dependencies).map_err(|e| decode("task dependencies", e))?;
    let download_patterns: Option<DownloadPatterns> = match download_patterns {
        Some(raw) => {
            Some(serde_json::from_str(&raw).map_err(|e| decode("download patterns", e))?)
        }
        None => None,
    };

    let mut task = Task::new(command).with_id(task_id);
    task.files = files;
    task.env = env;
    task.dependencies = dependencies;
    task.cores = cores;
    task.memory_gb = memory_gb;
    task.gpus = gpus;
    task.time_limit_minutes = time_limit_minutes;
    task.allow_dependency_failure = allow_dependency_failure;
    task.allow_failure = allow_failure;
    task.download_patterns = download_patterns;
    task.operator_key = operator_key;

    Ok((task, status, current_attempt_id))
}

const TASK_COLUMNS: &str = "task_id, command, files, env, dependencies, cores, memory_gb, gpus,
     time_limit_minutes, allow_dependency_failure, allow_failure, download_patterns,
     status, operator_key, current_attempt_id";

impl StateStore {
    /// Persist every task in a workflow, keyed by task id.
    ///
    /// Idempotent: re-adding updates the definition fields of existing rows
    /// and leaves their orchestration state (status, current attempt) alone.
    pub fn add_workflow(&self, workflow: &Workflow, run_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for task in workflow.tasks() {
            tx.execute(
                "INSERT INTO tasks
                    (task_id, run_id, command, files, env, dependencies, cores, memory_gb,
                     gpus, time_limit_minutes, allow_dependency_failure, allow_failure,
                     download_patterns, status, operator_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'PENDING', ?14)
                 ON CONFLICT (task_id) DO UPDATE SET
                    command = excluded.command,
                    files = excluded.files,
                    env = excluded.env,
                    dependencies = excluded.dependencies,
                    cores = excluded.cores,
                    memory_gb = excluded.memory_gb,
                    gpus = excluded.gpus,
                    time_limit_minutes = excluded.time_limit_minutes,
                    allow_dependency_failure = excluded.allow_dependency_failure,
                    allow_failure = excluded.allow_failure,
                    download_patterns = excluded.download_patterns,
                    operator_key = excluded.operator_key",
                params![
                    task.task_id,
                    run_id,
                    task.command,
                    serde_json::to_string(&task.files)?,
                    serde_json::to_string(&task.env)?,
                    serde_json::to_string(&task.dependencies)?,
                    task.cores,
                    task.memory_gb,
                    task.gpus,
                    task.time_limit_minutes,
                    task.allow_dependency_failure,
                    task.allow_failure,
                    task.download_patterns
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    task.operator_key,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// All tasks of a run, in insertion (workflow declaration) order.
    pub fn get_tasks(&self, run_id: &str) -> Result<Vec<TaskRow>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![run_id], task_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            let (task, status, current_attempt_id) = row?;
            let status = TaskStatus::parse(&status)
                .ok_or_else(|| StoreError::Sqlite(format!("unknown task status {status:?}")))?;
            out.push(TaskRow {
                task,
                status,
                current_attempt_id,
            });
        }
        Ok(out)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRow>, StoreError> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()?;
        let Some((task, status, current_attempt_id)) = row else {
            return Ok(None);
        };
        let status = TaskStatus::parse(&status)
            .ok_or_else(|| StoreError::Sqlite(format!("unknown task status {status:?}")))?;
        Ok(Some(TaskRow {
            task,
            status,
            current_attempt_id,
        }))
    }

    pub fn get_task_status(&self, task_id: &str) -> Result<Option<TaskStatus>, StoreError> {
        let conn = self.connection()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => TaskStatus::parse(&s)
                .map(Some)
                .ok_or_else(|| StoreError::Sqlite(format!("unknown task status {s:?}"))),
            None => Ok(None),
        }
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE tasks SET status = ?2 WHERE task_id = ?1",
            params![task_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    /// Clear the current-attempt pointer (used when a task is reset for rerun).
    pub fn clear_current_attempt(&self, task_id: &str) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE tasks SET current_attempt_id = NULL WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    /// Delete a task and its legacy external-run row. Attempt history is
    /// never deleted.
    pub fn delete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM external_runs WHERE task_id = ?1",
            params![task_id],
        )?;
        let deleted = tx.execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])?;
        tx.commit()?;
        if deleted == 0 {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matterstack_core::{RunHandle, RunStatus};
    use serde_json::json;

    fn seeded() -> (tempfile::TempDir, StateStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let handle = RunHandle::new("ws", "20240101_000000_bbbb0000", dir.path());
        let store = StateStore::open(handle.db_path()).unwrap();
        store
            .create_run(&handle, RunStatus::Pending, json!({}), None)
            .unwrap();
        (dir, store, handle.run_id)
    }

    fn two_task_workflow() -> Workflow {
        let mut wf = Workflow::new();
        wf.add_task(Task::new("echo a").with_id("a")).unwrap();
        wf.add_task(
            Task::new("echo b")
                .with_id("b")
                .with_dependency("a")
                .with_operator_key("local.default"),
        )
        .unwrap();
        wf
    }

    #[test]
    fn add_workflow_is_idempotent() {
        let (_dir, store, run_id) = seeded();
        let wf = two_task_workflow();
        store.add_workflow(&wf, &run_id).unwrap();
        store.update_task_status("a", TaskStatus::Completed).unwrap();

        // Re-adding must not reset orchestration state.
        store.add_workflow(&wf, &run_id).unwrap();
        let rows = store.get_tasks(&run_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, TaskStatus::Completed);
        assert_eq!(
            rows[1].task.operator_key.as_deref(),
            Some("local.default")
        );
    }

    #[test]
    fn tasks_come_back_in_declaration_order() {
        let (_dir, store, run_id) = seeded();
        store.add_workflow(&two_task_workflow(), &run_id).unwrap();
        let ids: Vec<String> = store
            .get_tasks(&run_id)
            .unwrap()
            .into_iter()
            .map(|r| r.task.task_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn task_round_trips_definition_fields() {
        let (_dir, store, run_id) = seeded();
        let mut wf = Workflow::new();
        wf.add_task(
            Task::new("python sim.py")
                .with_id("sim")
                .with_env("MATTERSTACK_OPERATOR", "hpc.default")
                .with_file("in.json", FileInput::Inline("{}".into()))
                .with_allow_failure(true),
        )
        .unwrap();
        store.add_workflow(&wf, &run_id).unwrap();

        let row = store.get_task("sim").unwrap().unwrap();
        assert_eq!(row.task.command, "python sim.py");
        assert!(row.task.allow_failure);
        assert_eq!(
            row.task.env.get("MATTERSTACK_OPERATOR").map(String::as_str),
            Some("hpc.default")
        );
        assert_eq!(row.status, TaskStatus::Pending);
        assert!(row.current_attempt_id.is_none());
    }

    #[test]
    fn delete_task_removes_row() {
        let (_dir, store, run_id) = seeded();
        store.add_workflow(&two_task_workflow(), &run_id).unwrap();
        store.delete_task("b").unwrap();
        assert!(store.get_task("b").unwrap().is_none());
        assert!(matches!(
            store.delete_task("b"),
            Err(StoreError::TaskNotFound(_))
        ));
    }
}
