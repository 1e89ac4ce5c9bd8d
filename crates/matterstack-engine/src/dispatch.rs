//! PLAN and EXECUTE phases: readiness refresh, concurrency slots, and
//! operator dispatch.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::{info, warn};

use matterstack_core::run::ExecutionMode;
use matterstack_core::{
    AttemptStatus, EngineError, RunConfig, RunHandle, Task, TaskStatus,
};
use matterstack_runtime::{AttemptRef, OperatorRegistry};
use matterstack_store::{AttemptUpdate, NewAttempt, StateStore, TaskRow};

use crate::hooks::{fire_safely, AttemptContext, LifecycleHook};
use crate::poll::dispatch_failure_status;

pub(crate) const ENV_OPERATOR_OVERRIDE: &str = "MATTERSTACK_OPERATOR";

/// Is every dependency of `task` satisfied for dispatch?
///
/// A dependency counts as satisfied when COMPLETED, or when terminal-failed
/// and this task tolerates failed dependencies.
pub(crate) fn dependencies_satisfied(
    task: &Task,
    status_by_id: &HashMap<String, TaskStatus>,
) -> bool {
    task.dependencies.iter().all(|dep| {
        match status_by_id.get(dep) {
            Some(TaskStatus::Completed) => true,
            Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                task.allow_dependency_failure
            }
            _ => false,
        }
    })
}

/// PLAN: recompute readiness for unstarted tasks. PENDING tasks whose
/// dependencies are satisfied become READY; READY tasks whose dependencies
/// regressed fall back to PENDING.
pub(crate) fn plan_phase(
    store: &StateStore,
    run: &RunHandle,
    tasks: &[TaskRow],
) -> Result<(), EngineError> {
    let status_by_id: HashMap<String, TaskStatus> = tasks
        .iter()
        .map(|row| (row.task.task_id.clone(), row.status))
        .collect();
    let active_ids = store.attempt_active_task_ids(&run.run_id)?;

    for row in tasks {
        if !matches!(row.status, TaskStatus::Pending | TaskStatus::Ready) {
            continue;
        }
        if active_ids.contains(&row.task.task_id) {
            continue;
        }
        let ready = dependencies_satisfied(&row.task, &status_by_id);
        let next = if ready {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        if next != row.status {
            store.update_task_status(&row.task.task_id, next)?;
        }
    }
    Ok(())
}

/// Routing decision for one task.
pub(crate) enum Route {
    Operator(String),
    /// Verification mode: complete without dispatch or attempt record.
    Simulate,
}

/// Operator-key precedence: the task field, then the env override, then the
/// run default, then the execution mode.
pub(crate) fn route_task(task: &Task, config: &RunConfig) -> Route {
    if let Some(key) = &task.operator_key {
        if let Some(env_key) = task.env.get(ENV_OPERATOR_OVERRIDE) {
            if env_key != key {
                warn!(
                    task_id = %task.task_id,
                    field = %key,
                    env = %env_key,
                    "task routing field and env override disagree; using the field"
                );
            }
        }
        return Route::Operator(key.clone());
    }
    if let Some(env_key) = task.env.get(ENV_OPERATOR_OVERRIDE) {
        return Route::Operator(env_key.clone());
    }
    if let Some(default) = &config.default_operator {
        return Route::Operator(default.clone());
    }
    match config.execution_mode {
        ExecutionMode::Simulation => Route::Simulate,
        ExecutionMode::Local => Route::Operator("local.default".to_string()),
        ExecutionMode::Hpc => Route::Operator("hpc.default".to_string()),
    }
}

/// Resume submission of attempts left in CREATED by a transient failure or
/// a crash between spawn and the durable write. Backend submits are
/// idempotent (job-id markers on disk), so no duplicate submission occurs.
fn resume_created_attempts(
    store: &StateStore,
    run: &RunHandle,
    registry: &OperatorRegistry,
    hooks: Option<&dyn LifecycleHook>,
) -> Result<(), EngineError> {
    for attempt in store.get_active_attempts(&run.run_id)? {
        if attempt.status != AttemptStatus::Created || attempt.external_id.is_some() {
            continue;
        }
        let Some(key) = crate::poll::attempt_operator_key(&attempt) else {
            continue;
        };
        let Some(operator) = registry.get(&key) else {
            continue;
        };
        // Attempts that never went through prepare (no evidence path) are
        // left for orphan cleanup.
        if attempt.evidence_path.is_none() {
            continue;
        }
        let handle = crate::poll::handle_from_attempt(run, &attempt);
        match operator.submit(handle) {
            Ok(submitted) => {
                info!(
                    attempt_id = %attempt.attempt_id,
                    external_id = submitted.external_id.as_deref().unwrap_or("-"),
                    "resumed submission of created attempt"
                );
                let mut update = AttemptUpdate::status(submitted.status)
                    .with_operator_data(Value::Object(submitted.operator_data.clone()));
                if let Some(external_id) = &submitted.external_id {
                    update = update.with_external_id(external_id.clone());
                }
                store.update_attempt(&attempt.attempt_id, update)?;
                store.update_task_status(&attempt.task_id, submitted.status.task_status())?;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    attempt_id = %attempt.attempt_id,
                    error = %err,
                    "transient submission failure; attempt stays CREATED"
                );
            }
            Err(err) => {
                warn!(attempt_id = %attempt.attempt_id, error = %err, "resubmission failed");
                store.update_attempt(
                    &attempt.attempt_id,
                    AttemptUpdate::status(AttemptStatus::FailedInit).with_reason(err.to_string()),
                )?;
                store.update_task_status(&attempt.task_id, TaskStatus::Failed)?;
                if let Some(hooks) = hooks {
                    let context = crate::poll::hook_context(&run.run_id, &attempt);
                    let message = err.to_string();
                    fire_safely(|| hooks.on_fail(&context, &message), "on_fail");
                }
            }
        }
    }
    Ok(())
}

/// EXECUTE: submit READY tasks in workflow order until global or
/// per-operator slots are exhausted. Returns the number of dispatches.
pub(crate) fn execute_phase(
    store: &StateStore,
    run: &RunHandle,
    registry: &OperatorRegistry,
    config: &RunConfig,
    hooks: Option<&dyn LifecycleHook>,
) -> Result<usize, EngineError> {
    resume_created_attempts(store, run, registry, hooks)?;

    let global_limit = registry
        .max_concurrent_global()
        .map(|v| v as usize)
        .unwrap_or(config.max_concurrent_global);

    let mut active_total: usize = store.get_active_attempts(&run.run_id)?.len();
    let mut active_by_operator: BTreeMap<String, usize> =
        store.count_active_attempts_by_operator(&run.run_id)?;
    let active_task_ids = store.attempt_active_task_ids(&run.run_id)?;

    let mut submitted = 0usize;
    for row in store.get_tasks(&run.run_id)? {
        if row.status != TaskStatus::Ready {
            continue;
        }
        if active_task_ids.contains(&row.task.task_id) {
            continue;
        }
        if active_total >= global_limit {
            info!(
                limit = global_limit,
                "global concurrency limit reached; postponing remaining ready tasks"
            );
            break;
        }

        let raw_key = match route_task(&row.task, config) {
            Route::Operator(key) => key,
            Route::Simulate => {
                info!(task_id = %row.task.task_id, "simulation mode: completing without dispatch");
                store.update_task_status(&row.task.task_id, TaskStatus::Completed)?;
                continue;
            }
        };

        let Some(canonical) = registry.resolve_key(&raw_key) else {
            // Deterministic failure with provenance, never a silent skip.
            warn!(task_id = %row.task.task_id, key = %raw_key, "unknown operator key at dispatch");
            let attempt_id = store.create_attempt(
                &run.run_id,
                &row.task.task_id,
                NewAttempt {
                    operator_key: Some(raw_key.clone()),
                    ..NewAttempt::default()
                },
            )?;
            store.update_attempt(
                &attempt_id,
                AttemptUpdate::status(AttemptStatus::FailedInit)
                    .with_reason(format!("unknown operator key: {raw_key}")),
            )?;
            store.update_task_status(&row.task.task_id, TaskStatus::Failed)?;
            continue;
        };

        let operator_limit = registry
            .max_concurrent(&canonical)
            .map(|v| v as usize)
            .unwrap_or(global_limit);
        let active_here = active_by_operator.get(&canonical).copied().unwrap_or(0);
        if active_here >= operator_limit {
            info!(
                operator = %canonical,
                active = active_here,
                limit = operator_limit,
                task_id = %row.task.task_id,
                "operator concurrency limit reached; postponing task"
            );
            continue;
        }

        dispatch_task(store, run, registry, &row.task, &canonical, hooks)?;
        active_total += 1;
        *active_by_operator.entry(canonical).or_insert(0) += 1;
        submitted += 1;
    }
    Ok(submitted)
}

fn dispatch_task(
    store: &StateStore,
    run: &RunHandle,
    registry: &OperatorRegistry,
    task: &Task,
    operator_key: &str,
    hooks: Option<&dyn LifecycleHook>,
) -> Result<(), EngineError> {
    let operator = registry
        .get(operator_key)
        .ok_or_else(|| EngineError::UnknownOperatorKey(operator_key.to_string()))?;

    let attempt_id = store.create_attempt(
        &run.run_id,
        task.task_id.as_str(),
        NewAttempt {
            operator_key: Some(operator_key.to_string()),
            ..NewAttempt::default()
        },
    )?;
    let record = store
        .get_attempt(&attempt_id)?
        .ok_or_else(|| EngineError::AttemptNotFound(attempt_id.clone()))?;

    let evidence_rel = format!("tasks/{}/attempts/{attempt_id}", task.task_id);
    let workdir_remote = registry.remote_root(operator_key).map(|root| {
        format!(
            "{}/{}/{}/{}/{attempt_id}",
            root.trim_end_matches('/'),
            run.workspace_slug,
            run.run_id,
            task.task_id
        )
    });
    let attempt = AttemptRef {
        run_id: run.run_id.clone(),
        task_id: task.task_id.clone(),
        attempt_id: attempt_id.clone(),
        attempt_index: record.attempt_index,
        operator_key: operator_key.to_string(),
        evidence_dir: run.root_path.join(&evidence_rel),
        evidence_rel: evidence_rel.clone(),
        workdir_remote,
    };

    let context = AttemptContext {
        run_id: run.run_id.clone(),
        task_id: task.task_id.clone(),
        attempt_id: attempt_id.clone(),
        operator_key: Some(operator_key.to_string()),
        attempt_index: record.attempt_index,
    };
    if let Some(hooks) = hooks {
        fire_safely(|| hooks.on_create(&context), "on_create");
    }

    info!(
        task_id = %task.task_id,
        attempt_id = %attempt_id,
        operator = %operator_key,
        "dispatching task"
    );

    let prepared = match operator.prepare(run, task, &attempt) {
        Ok(handle) => handle,
        Err(err) => {
            return record_dispatch_failure(store, run, &attempt_id, task, &err, &context, hooks)
        }
    };

    // Persist preparation results (evidence path, config snapshot metadata)
    // before submission, so a crash between the two is recoverable.
    let config_hash = prepared.data_str("config_hash").map(str::to_string);
    let config_files = prepared.operator_data.get("config_snapshot").cloned();
    store.update_attempt(
        &attempt_id,
        AttemptUpdate {
            operator_data: Some(Value::Object(prepared.operator_data.clone())),
            evidence_path: Some(evidence_rel.clone()),
            workdir_remote: attempt.workdir_remote.clone(),
            config_hash,
            config_files,
            ..AttemptUpdate::default()
        },
    )?;

    match operator.submit(prepared) {
        Ok(submitted) => {
            let mut update = AttemptUpdate::status(submitted.status)
                .with_operator_data(Value::Object(submitted.operator_data.clone()));
            if let Some(external_id) = &submitted.external_id {
                update = update.with_external_id(external_id.clone());
            }
            store.update_attempt(&attempt_id, update)?;
            store.update_task_status(&task.task_id, submitted.status.task_status())?;
            if let Some(hooks) = hooks {
                let external = submitted.external_id.clone();
                fire_safely(
                    || hooks.on_submit(&context, external.as_deref()),
                    "on_submit",
                );
            }
            Ok(())
        }
        Err(err) => record_dispatch_failure(store, run, &attempt_id, task, &err, &context, hooks),
    }
}

fn record_dispatch_failure(
    store: &StateStore,
    _run: &RunHandle,
    attempt_id: &str,
    task: &Task,
    err: &matterstack_core::OperatorError,
    context: &AttemptContext,
    hooks: Option<&dyn LifecycleHook>,
) -> Result<(), EngineError> {
    match dispatch_failure_status(err) {
        // Transient: leave the attempt in CREATED; the next tick retries
        // submission through the idempotent submit path.
        None => {
            warn!(
                attempt_id = %attempt_id,
                error = %err,
                "transient submission failure; attempt stays CREATED"
            );
            Ok(())
        }
        Some(status) => {
            warn!(attempt_id = %attempt_id, error = %err, "dispatch failed");
            store.update_attempt(
                attempt_id,
                AttemptUpdate::status(status).with_reason(err.to_string()),
            )?;
            store.update_task_status(&task.task_id, TaskStatus::Failed)?;
            if let Some(hooks) = hooks {
                let message = err.to_string();
                fire_safely(|| hooks.on_fail(context, &message), "on_fail");
            }
            Ok(())
        }
    }
}
