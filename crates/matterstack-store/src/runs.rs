//! Run operations.

use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use matterstack_core::{RunHandle, RunStatus};

use crate::records::RunRecord;
use crate::store::{ms_to_datetime, now_ms, StateStore, StoreError};

impl StateStore {
    /// Insert the run row. Fails if the run already exists.
    pub fn create_run(
        &self,
        handle: &RunHandle,
        status: RunStatus,
        tags: Value,
        description: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO runs
                (run_id, workspace_slug, root_path, status, tags, description, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                handle.run_id,
                handle.workspace_slug,
                handle.root_path.display().to_string(),
                status.as_str(),
                serde_json::to_string(&tags)?,
                description,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT run_id, workspace_slug, root_path, status, status_reason,
                        tags, description, created_at_ms
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((run_id, workspace_slug, root_path, status, status_reason, tags, description, created_at_ms)) =
            row
        else {
            return Ok(None);
        };
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Sqlite(format!("unknown run status {status:?}")))?;
        Ok(Some(RunRecord {
            run_id,
            workspace_slug,
            root_path,
            status,
            status_reason,
            tags: serde_json::from_str(&tags)?,
            description,
            created_at: ms_to_datetime(created_at_ms),
        }))
    }

    pub fn get_run_status(&self, run_id: &str) -> Result<Option<RunStatus>, StoreError> {
        let conn = self.connection()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => RunStatus::parse(&s)
                .map(Some)
                .ok_or_else(|| StoreError::Sqlite(format!("unknown run status {s:?}"))),
            None => Ok(None),
        }
    }

    pub fn get_run_status_reason(&self, run_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connection()?;
        let reason: Option<Option<String>> = conn
            .query_row(
                "SELECT status_reason FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason.flatten())
    }

    /// Update run status, optionally recording a reason.
    pub fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.connection()?;
        let updated = match reason {
            Some(reason) => conn.execute(
                "UPDATE runs SET status = ?2, status_reason = ?3 WHERE run_id = ?1",
                params![run_id, status.as_str(), reason],
            )?,
            None => conn.execute(
                "UPDATE runs SET status = ?2 WHERE run_id = ?1",
                params![run_id, status.as_str()],
            )?,
        };
        if updated == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, StateStore, RunHandle) {
        let dir = tempfile::tempdir().unwrap();
        let handle = RunHandle::new("ws", "20240101_000000_aaaa0000", dir.path());
        let store = StateStore::open(handle.db_path()).unwrap();
        (dir, store, handle)
    }

    #[test]
    fn create_and_fetch_run() {
        let (_dir, store, handle) = store();
        store
            .create_run(&handle, RunStatus::Pending, json!({"team": "coatings"}), Some("demo"))
            .unwrap();

        let record = store.get_run(&handle.run_id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.tags["team"], "coatings");
        assert_eq!(record.description.as_deref(), Some("demo"));
        assert!(store.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn status_transitions_persist_reason() {
        let (_dir, store, handle) = store();
        store
            .create_run(&handle, RunStatus::Pending, json!({}), None)
            .unwrap();

        store
            .set_run_status(&handle.run_id, RunStatus::Failed, Some("workflow tasks failed"))
            .unwrap();
        assert_eq!(
            store.get_run_status(&handle.run_id).unwrap(),
            Some(RunStatus::Failed)
        );
        assert_eq!(
            store.get_run_status_reason(&handle.run_id).unwrap().as_deref(),
            Some("workflow tasks failed")
        );

        let err = store.set_run_status("missing", RunStatus::Running, None);
        assert!(matches!(err, Err(StoreError::RunNotFound(_))));
    }
}
