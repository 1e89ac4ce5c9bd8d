//! Audited control commands: pause, resume, cancel, revive, rerun,
//! cancel-attempt.
//!
//! Every command takes the run lock, mutates state, and appends a RunEvent
//! naming the action and actor.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde_json::json;
use tracing::{info, warn};

use matterstack_core::{AttemptStatus, EngineError, RunHandle, RunStatus, TaskStatus};
use matterstack_runtime::OperatorRegistry;
use matterstack_store::{AttemptUpdate, StateStore};

use crate::poll::handle_from_attempt;

fn open_locked(run: &RunHandle) -> Result<(StateStore, matterstack_store::RunLock), EngineError> {
    let store = StateStore::open(run.db_path()).map_err(EngineError::from)?;
    let lock = store.lock().map_err(EngineError::from)?;
    Ok((store, lock))
}

fn current_status(store: &StateStore, run: &RunHandle) -> Result<RunStatus, EngineError> {
    store
        .get_run_status(&run.run_id)?
        .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))
}

/// Pause a run: POLL continues on later ticks, EXECUTE is suppressed.
pub fn pause_run(run: &RunHandle, actor: &str) -> Result<(), EngineError> {
    let (store, _lock) = open_locked(run)?;
    let status = current_status(&store, run)?;
    if status.is_terminal() {
        return Err(EngineError::Invalid(format!(
            "cannot pause a {} run",
            status.as_str()
        )));
    }
    store.set_run_status(&run.run_id, RunStatus::Paused, None)?;
    store.record_event(&run.run_id, "pause", actor, json!({}))?;
    info!(run_id = %run.run_id, "run paused");
    Ok(())
}

pub fn resume_run(run: &RunHandle, actor: &str) -> Result<(), EngineError> {
    let (store, _lock) = open_locked(run)?;
    let status = current_status(&store, run)?;
    if status != RunStatus::Paused {
        return Err(EngineError::Invalid(format!(
            "cannot resume a {} run",
            status.as_str()
        )));
    }
    store.set_run_status(&run.run_id, RunStatus::Running, None)?;
    store.record_event(&run.run_id, "resume", actor, json!({}))?;
    info!(run_id = %run.run_id, "run resumed");
    Ok(())
}

/// Cancel a run. In-flight attempts keep being polled by later ticks until
/// they reach a terminal state.
pub fn cancel_run(run: &RunHandle, reason: &str, actor: &str) -> Result<(), EngineError> {
    let (store, _lock) = open_locked(run)?;
    let status = current_status(&store, run)?;
    if status.is_terminal() {
        return Err(EngineError::Invalid(format!(
            "cannot cancel a {} run",
            status.as_str()
        )));
    }
    store.set_run_status(&run.run_id, RunStatus::Cancelled, Some(reason))?;
    store.record_event(&run.run_id, "cancel", actor, json!({ "reason": reason }))?;
    info!(run_id = %run.run_id, reason = %reason, "run cancelled");
    Ok(())
}

/// Revive a terminal run back to RUNNING.
pub fn revive_run(run: &RunHandle, actor: &str) -> Result<(), EngineError> {
    let (store, _lock) = open_locked(run)?;
    let status = current_status(&store, run)?;
    if !status.is_terminal() {
        return Err(EngineError::Invalid(format!(
            "run is {}; only terminal runs can be revived",
            status.as_str()
        )));
    }
    store.set_run_status(&run.run_id, RunStatus::Running, Some("revived"))?;
    store.record_event(
        &run.run_id,
        "revive",
        actor,
        json!({ "previous_status": status.as_str() }),
    )?;
    info!(run_id = %run.run_id, from = status.as_str(), "run revived");
    Ok(())
}

/// Transitive dependents of a task within its run.
fn collect_dependents(
    store: &StateStore,
    run_id: &str,
    task_id: &str,
) -> Result<BTreeSet<String>, EngineError> {
    let tasks = store.get_tasks(run_id)?;
    let mut dependents_of: HashMap<&str, Vec<&str>> = HashMap::new();
    for row in &tasks {
        for dep in &row.task.dependencies {
            dependents_of
                .entry(dep.as_str())
                .or_default()
                .push(row.task.task_id.as_str());
        }
    }

    let mut found = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([task_id]);
    let mut seen: BTreeSet<&str> = BTreeSet::from([task_id]);
    while let Some(current) = queue.pop_front() {
        if let Some(children) = dependents_of.get(current) {
            for child in children {
                if seen.insert(child) {
                    found.insert((*child).to_string());
                    queue.push_back(child);
                }
            }
        }
    }
    Ok(found)
}

/// Reset a task (and optionally its transitive dependents) to PENDING so the
/// next tick creates fresh attempts. Prior attempts and their evidence stay
/// untouched; active ones are marked CANCELLED.
pub fn rerun_task(
    run: &RunHandle,
    task_id: &str,
    recursive: bool,
    actor: &str,
) -> Result<Vec<String>, EngineError> {
    let (store, _lock) = open_locked(run)?;
    if store.get_task(task_id)?.is_none() {
        return Err(EngineError::TaskNotFound(task_id.to_string()));
    }

    let mut targets = BTreeSet::from([task_id.to_string()]);
    if recursive {
        targets.extend(collect_dependents(&store, &run.run_id, task_id)?);
    }

    for target in &targets {
        for attempt in store.list_attempts(target)? {
            if !attempt.status.is_terminal() {
                store.update_attempt(
                    &attempt.attempt_id,
                    AttemptUpdate::status(AttemptStatus::Cancelled)
                        .with_reason("superseded by rerun"),
                )?;
            }
        }
        store.cancel_external_runs(target)?;
        store.clear_current_attempt(target)?;
        store.update_task_status(target, TaskStatus::Pending)?;
        info!(run_id = %run.run_id, task_id = %target, "task reset for rerun");
    }

    store.record_event(
        &run.run_id,
        "rerun",
        actor,
        json!({
            "task_id": task_id,
            "recursive": recursive,
            "targets": targets.iter().collect::<Vec<_>>(),
        }),
    )?;
    Ok(targets.into_iter().collect())
}

/// Cancel one attempt: best-effort operator cancel, then CANCELLED with a
/// reason. The owning task becomes eligible again only via an explicit rerun.
pub fn cancel_attempt(
    run: &RunHandle,
    attempt_id: &str,
    registry: Option<&OperatorRegistry>,
    reason: &str,
    actor: &str,
) -> Result<(), EngineError> {
    let (store, _lock) = open_locked(run)?;
    let attempt = store
        .get_attempt(attempt_id)?
        .ok_or_else(|| EngineError::AttemptNotFound(attempt_id.to_string()))?;
    if attempt.status.is_terminal() {
        return Err(EngineError::TerminalAttempt(attempt_id.to_string()));
    }

    if let (Some(registry), Some(key)) = (registry, crate::poll::attempt_operator_key(&attempt)) {
        if let Some(operator) = registry.get(&key) {
            let handle = handle_from_attempt(run, &attempt);
            if let Err(err) = operator.cancel(&handle) {
                warn!(attempt_id = %attempt_id, error = %err, "operator cancel failed");
            }
        }
    }

    store.update_attempt(
        attempt_id,
        AttemptUpdate::status(AttemptStatus::Cancelled).with_reason(reason),
    )?;
    store.update_task_status(&attempt.task_id, TaskStatus::Cancelled)?;
    store.record_event(
        &run.run_id,
        "cancel_attempt",
        actor,
        json!({ "attempt_id": attempt_id, "task_id": attempt.task_id, "reason": reason }),
    )?;
    info!(attempt_id = %attempt_id, "attempt cancelled");
    Ok(())
}
