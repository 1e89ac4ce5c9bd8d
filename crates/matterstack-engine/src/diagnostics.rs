//! Frontier diagnostics: why is this run not finished yet?

use std::collections::HashMap;

use serde::Serialize;

use matterstack_core::{EngineError, RunHandle, TaskStatus};
use matterstack_runtime::OperatorRegistry;
use matterstack_store::StateStore;

use crate::dispatch::dependencies_satisfied;
use crate::poll::{attempt_operator_key, handle_from_attempt};

/// Classification of one blocking item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockingKind {
    /// Upstream tasks have not finished.
    WaitingDependency { dependency_ids: Vec<String> },
    /// An external party or backend must act.
    WaitingExternal {
        operator_key: Option<String>,
        evidence_path: Option<String>,
        hint: String,
    },
    Running,
    /// Dispatchable; waiting on a scheduler slot.
    Ready,
}

/// One non-terminal task and what it is waiting on.
#[derive(Clone, Debug, Serialize)]
pub struct BlockingItem {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(flatten)]
    pub kind: BlockingKind,
}

/// Compute the set of items blocking run completion, each with a
/// human-actionable hint.
pub fn frontier(
    run: &RunHandle,
    registry: Option<&OperatorRegistry>,
) -> Result<Vec<BlockingItem>, EngineError> {
    let store = StateStore::open(run.db_path()).map_err(EngineError::from)?;
    let tasks = store.get_tasks(&run.run_id)?;
    let status_by_id: HashMap<String, TaskStatus> = tasks
        .iter()
        .map(|row| (row.task.task_id.clone(), row.status))
        .collect();

    let mut items = Vec::new();
    for row in &tasks {
        if row.status.is_terminal() {
            continue;
        }
        let kind = match row.status {
            TaskStatus::Running => BlockingKind::Running,
            TaskStatus::Ready => BlockingKind::Ready,
            TaskStatus::Submitted | TaskStatus::WaitingExternal => {
                let attempt = store.get_current_attempt(&row.task.task_id)?;
                let (operator_key, evidence_path, hint) = match attempt {
                    Some(attempt) => {
                        let key = attempt_operator_key(&attempt);
                        let hint = key
                            .as_deref()
                            .and_then(|k| registry.and_then(|r| r.get(k)))
                            .map(|op| op.waiting_hint(&handle_from_attempt(run, &attempt)))
                            .unwrap_or_else(|| "check operator logs".to_string());
                        (key, attempt.evidence_path.clone(), hint)
                    }
                    None => (
                        None,
                        None,
                        "marked external but no attempt found".to_string(),
                    ),
                };
                BlockingKind::WaitingExternal {
                    operator_key,
                    evidence_path,
                    hint,
                }
            }
            TaskStatus::Pending => {
                if dependencies_satisfied(&row.task, &status_by_id) {
                    BlockingKind::Ready
                } else {
                    let blocked_on: Vec<String> = row
                        .task
                        .dependencies
                        .iter()
                        .filter(|dep| {
                            !matches!(
                                status_by_id.get(dep.as_str()),
                                Some(TaskStatus::Completed)
                            )
                        })
                        .cloned()
                        .collect();
                    BlockingKind::WaitingDependency {
                        dependency_ids: blocked_on,
                    }
                }
            }
            // Terminal statuses are filtered above.
            _ => continue,
        };
        items.push(BlockingItem {
            task_id: row.task.task_id.clone(),
            status: row.status,
            kind,
        });
    }
    Ok(items)
}
