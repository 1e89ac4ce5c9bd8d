//! Append-only audit events for manual interventions.

use rusqlite::params;
use serde_json::Value;

use crate::records::EventRecord;
use crate::store::{ms_to_datetime, now_ms, StateStore, StoreError};

impl StateStore {
    /// Append an audit event. Events are never mutated or deleted.
    pub fn record_event(
        &self,
        run_id: &str,
        action: &str,
        actor: &str,
        payload: Value,
    ) -> Result<i64, StoreError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO run_events (run_id, at_ms, action, actor, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, now_ms(), action, actor, serde_json::to_string(&payload)?],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events for a run in insertion order.
    pub fn list_events(&self, run_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, run_id, at_ms, action, actor, payload
             FROM run_events WHERE run_id = ?1 ORDER BY event_id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (event_id, run_id, at_ms, action, actor, payload) = row?;
            out.push(EventRecord {
                event_id,
                run_id,
                at: ms_to_datetime(at_ms),
                action,
                actor,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matterstack_core::{RunHandle, RunStatus};
    use serde_json::json;

    #[test]
    fn events_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let handle = RunHandle::new("ws", "20240101_000000_eeee0000", dir.path());
        let store = StateStore::open(handle.db_path()).unwrap();
        store
            .create_run(&handle, RunStatus::Running, json!({}), None)
            .unwrap();

        store
            .record_event(&handle.run_id, "pause", "cli", json!({}))
            .unwrap();
        store
            .record_event(
                &handle.run_id,
                "rerun",
                "cli",
                json!({"task_id": "t1", "recursive": true}),
            )
            .unwrap();

        let events = store.list_events(&handle.run_id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "pause");
        assert_eq!(events[1].action, "rerun");
        assert_eq!(events[1].payload["task_id"], "t1");
        assert!(events[0].event_id < events[1].event_id);
    }
}
