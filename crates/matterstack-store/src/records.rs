//! Row types returned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use matterstack_core::{AttemptStatus, RunStatus, Task, TaskStatus};

/// Run row: identity plus lifecycle metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workspace_slug: String,
    pub root_path: String,
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub tags: Value,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A task definition together with its mutable orchestration state.
#[derive(Clone, Debug)]
pub struct TaskRow {
    pub task: Task,
    pub status: TaskStatus,
    pub current_attempt_id: Option<String>,
}

/// One immutable execution trial of a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub task_id: String,
    pub run_id: String,
    pub attempt_index: u32,
    pub status: AttemptStatus,
    pub operator_key: Option<String>,
    pub operator_type: Option<String>,
    pub external_id: Option<String>,
    pub operator_data: Value,
    /// Evidence directory relative to the run root.
    pub evidence_path: Option<String>,
    /// Attempt-scoped remote working directory.
    pub workdir_remote: Option<String>,
    pub config_hash: Option<String>,
    pub config_files: Option<Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,
}

/// Legacy (schema v1) external-run row, retained for back-compat polling.
#[derive(Clone, Debug)]
pub struct ExternalRunRecord {
    pub task_id: String,
    pub run_id: String,
    pub operator_type: String,
    pub external_id: Option<String>,
    pub status: AttemptStatus,
    pub operator_data: Value,
    pub relative_path: Option<String>,
}

/// Append-only audit entry for manual interventions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: i64,
    pub run_id: String,
    pub at: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub payload: Value,
}
