//! ANALYZE phase: fold terminal task results into the campaign state and
//! plan the next iteration.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{error, info};

use matterstack_core::{
    Campaign, EngineError, RunHandle, RunStatus, TaskResult, TaskResults, TaskStatus,
};
use matterstack_store::{StateStore, TaskRow};

/// Load the opaque campaign state blob from the run root.
pub(crate) fn load_campaign_state(run: &RunHandle) -> Option<Value> {
    let path = run.campaign_state_path();
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

pub(crate) fn persist_campaign_state(run: &RunHandle, state: &Value) -> Result<(), EngineError> {
    let raw = serde_json::to_string_pretty(state)
        .map_err(|e| EngineError::Storage(format!("encode campaign state: {e}")))?;
    std::fs::write(run.campaign_state_path(), raw)?;
    Ok(())
}

/// Build the task_id -> result mapping handed to `analyze`, drawn from each
/// task's current attempt.
pub(crate) fn build_task_results(
    store: &StateStore,
    tasks: &[TaskRow],
) -> Result<TaskResults, EngineError> {
    let mut results = TaskResults::new();
    for row in tasks {
        let mut entry = TaskResult {
            status: Some(row.status),
            ..TaskResult::default()
        };

        let attempt = match store.get_current_attempt(&row.task.task_id)? {
            Some(attempt) => Some(attempt),
            // Pointer missing but history exists: fall back to the latest.
            None => store.list_attempts(&row.task.task_id)?.into_iter().last(),
        };

        if let Some(attempt) = attempt {
            entry.attempt_id = Some(attempt.attempt_id.clone());
            entry.attempt_index = Some(attempt.attempt_index);
            entry.operator_key = attempt.operator_key.clone();
            entry.reason = attempt.status_reason.clone();
            if let Some(files) = attempt.operator_data.get("output_files") {
                if let Some(map) = files.as_object() {
                    entry.files = map
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect::<BTreeMap<_, _>>();
                }
            }
            entry.data = attempt.operator_data.get("output_data").cloned();
        }
        results.insert(row.task.task_id.clone(), entry);
    }
    Ok(results)
}

/// Outcome of the ANALYZE phase.
pub(crate) enum AnalyzeOutcome {
    /// Not every task is terminal yet; nothing analyzed.
    NotReady,
    /// A hard-failed task stops the run.
    RunFailed(String),
    /// Campaign produced another workflow.
    Continued,
    /// Campaign returned no further work.
    Completed,
}

/// Run ANALYZE when the whole current workflow is terminal.
///
/// A terminal FAILED or CANCELLED task without `allow_failure` fails the run
/// instead of analyzing; analysis never runs over partial results.
pub(crate) fn analyze_phase(
    store: &StateStore,
    run: &RunHandle,
    campaign: &dyn Campaign,
    tasks: &[TaskRow],
) -> Result<AnalyzeOutcome, EngineError> {
    if tasks.iter().any(|row| !row.status.is_terminal()) {
        return Ok(AnalyzeOutcome::NotReady);
    }

    let hard_failed: Vec<&TaskRow> = tasks
        .iter()
        .filter(|row| {
            matches!(row.status, TaskStatus::Failed | TaskStatus::Cancelled)
                && !row.task.allow_failure
        })
        .collect();
    if !hard_failed.is_empty() {
        let ids: Vec<&str> = hard_failed
            .iter()
            .map(|row| row.task.task_id.as_str())
            .collect();
        let reason = format!("workflow tasks failed: {}", ids.join(", "));
        error!(run_id = %run.run_id, reason = %reason, "stopping run");
        store.set_run_status(&run.run_id, RunStatus::Failed, Some(&reason))?;
        return Ok(AnalyzeOutcome::RunFailed(reason));
    }

    info!(run_id = %run.run_id, "workflow complete; analyzing");
    let results = build_task_results(store, tasks)?;
    let state = load_campaign_state(run);

    let new_state = match campaign.analyze(state, &results) {
        Ok(state) => state,
        Err(err) => {
            let reason = format!("analyze failed: {err}");
            store.set_run_status(&run.run_id, RunStatus::Failed, Some(&reason))?;
            return Ok(AnalyzeOutcome::RunFailed(reason));
        }
    };
    persist_campaign_state(run, &new_state)?;

    match campaign.plan(Some(&new_state)) {
        Ok(Some(workflow)) => {
            info!(
                run_id = %run.run_id,
                tasks = workflow.len(),
                "campaign planned next workflow"
            );
            store.add_workflow(&workflow, &run.run_id)?;
            Ok(AnalyzeOutcome::Continued)
        }
        Ok(None) => {
            info!(run_id = %run.run_id, "campaign has no further work; run completed");
            store.set_run_status(&run.run_id, RunStatus::Completed, None)?;
            Ok(AnalyzeOutcome::Completed)
        }
        Err(err) => {
            let reason = format!("plan failed: {err}");
            store.set_run_status(&run.run_id, RunStatus::Failed, Some(&reason))?;
            Ok(AnalyzeOutcome::RunFailed(reason))
        }
    }
}
