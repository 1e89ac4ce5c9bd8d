//! POLL phase: observe every non-terminal attempt and fold backend state
//! into the store.

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use matterstack_core::{
    legacy_operator_type_to_key, AttemptStatus, EngineError, OperatorError, RunConfig, RunHandle,
};
use matterstack_runtime::{OperatorHandle, OperatorOutcome, OperatorRegistry};
use matterstack_store::{AttemptRecord, AttemptUpdate, StateStore};

use crate::hooks::{fire_safely, AttemptContext, LifecycleHook};

/// Canonical-or-best-effort operator key for an attempt: the v3 column, the
/// transitional operator_data field, then the legacy type map.
pub(crate) fn attempt_operator_key(attempt: &AttemptRecord) -> Option<String> {
    if let Some(key) = &attempt.operator_key {
        if !key.is_empty() {
            return Some(key.clone());
        }
    }
    if let Some(key) = attempt
        .operator_data
        .get("operator_key")
        .and_then(Value::as_str)
    {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    attempt
        .operator_type
        .as_deref()
        .and_then(legacy_operator_type_to_key)
}

pub(crate) fn handle_from_attempt(run: &RunHandle, attempt: &AttemptRecord) -> OperatorHandle {
    let evidence_dir = match &attempt.evidence_path {
        Some(rel) => run.root_path.join(rel),
        None => run.attempt_dir(&attempt.task_id, &attempt.attempt_id),
    };
    let operator_data: Map<String, Value> = match &attempt.operator_data {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    OperatorHandle {
        task_id: attempt.task_id.clone(),
        attempt_id: attempt.attempt_id.clone(),
        operator_key: attempt.operator_key.clone().unwrap_or_default(),
        status: attempt.status,
        external_id: attempt.external_id.clone(),
        operator_data,
        evidence_dir,
        workdir_remote: attempt.workdir_remote.clone(),
        reason: attempt.status_reason.clone(),
    }
}

pub(crate) fn hook_context(run_id: &str, attempt: &AttemptRecord) -> AttemptContext {
    AttemptContext {
        run_id: run_id.to_string(),
        task_id: attempt.task_id.clone(),
        attempt_id: attempt.attempt_id.clone(),
        operator_key: attempt.operator_key.clone(),
        attempt_index: attempt.attempt_index,
    }
}

/// Merge a collect outcome into the handle's operator data.
fn merge_outcome(data: &mut Map<String, Value>, outcome: &OperatorOutcome) {
    if !outcome.files.is_empty() {
        let files: Map<String, Value> = outcome
            .files
            .iter()
            .map(|(name, path)| {
                (
                    name.clone(),
                    Value::String(path.display().to_string()),
                )
            })
            .collect();
        data.insert("output_files".to_string(), Value::Object(files));
    }
    if let Some(value) = &outcome.data {
        data.insert("output_data".to_string(), value.clone());
    }
}

fn fail_attempt(
    store: &StateStore,
    run_id: &str,
    attempt: &AttemptRecord,
    status: AttemptStatus,
    reason: &str,
    hooks: Option<&dyn LifecycleHook>,
) -> Result<(), EngineError> {
    store.update_attempt(
        &attempt.attempt_id,
        AttemptUpdate::status(status).with_reason(reason),
    )?;
    store.update_task_status(&attempt.task_id, status.task_status())?;
    if let Some(hooks) = hooks {
        let context = hook_context(run_id, attempt);
        fire_safely(|| hooks.on_fail(&context, reason), "on_fail");
    }
    Ok(())
}

/// Poll all active attempts, then legacy external-run rows for tasks that
/// have no attempts.
pub(crate) fn poll_phase(
    store: &StateStore,
    run: &RunHandle,
    registry: &OperatorRegistry,
    config: &RunConfig,
    hooks: Option<&dyn LifecycleHook>,
) -> Result<(), EngineError> {
    // Stuck-attempt cleanup: CREATED with no external id past the timeout
    // will never advance on its own.
    let cutoff = Utc::now() - Duration::seconds(config.stuck_attempt_timeout_seconds as i64);
    for orphan in store.find_orphaned_attempts(&run.run_id, cutoff)? {
        warn!(
            attempt_id = %orphan.attempt_id,
            task_id = %orphan.task_id,
            "attempt stuck in CREATED with no external id; marking FAILED_INIT"
        );
        fail_attempt(
            store,
            &run.run_id,
            &orphan,
            AttemptStatus::FailedInit,
            &format!(
                "stuck in CREATED with no external id after {}s",
                config.stuck_attempt_timeout_seconds
            ),
            hooks,
        )?;
    }

    for attempt in store.get_active_attempts(&run.run_id)? {
        let Some(key) = attempt_operator_key(&attempt) else {
            fail_attempt(
                store,
                &run.run_id,
                &attempt,
                AttemptStatus::Failed,
                "attempt carries no resolvable operator key",
                hooks,
            )?;
            continue;
        };
        let Some(operator) = registry.get(&key) else {
            fail_attempt(
                store,
                &run.run_id,
                &attempt,
                AttemptStatus::Failed,
                &format!("unknown operator key: {key}"),
                hooks,
            )?;
            continue;
        };

        let handle = handle_from_attempt(run, &attempt);
        let previous_status = handle.status;
        let mut updated = match operator.check(&handle) {
            Ok(updated) => updated,
            Err(err) if err.is_transient() => {
                warn!(
                    attempt_id = %attempt.attempt_id,
                    error = %err,
                    "transient backend error during poll; will retry"
                );
                continue;
            }
            Err(err) => {
                fail_attempt(
                    store,
                    &run.run_id,
                    &attempt,
                    AttemptStatus::Failed,
                    &err.to_string(),
                    hooks,
                )?;
                continue;
            }
        };

        if updated.status != previous_status {
            info!(
                attempt_id = %attempt.attempt_id,
                task_id = %attempt.task_id,
                from = previous_status.as_str(),
                to = updated.status.as_str(),
                "attempt transitioned"
            );
        }

        // The single collect point: an attempt only reaches COMPLETED
        // through a successful collect.
        if updated.status == AttemptStatus::Completed {
            match operator.collect(&updated) {
                Ok(outcome) => merge_outcome(&mut updated.operator_data, &outcome),
                Err(err) => {
                    error!(
                        attempt_id = %attempt.attempt_id,
                        error = %err,
                        "collect failed; failing attempt"
                    );
                    updated.status = AttemptStatus::Failed;
                    updated.reason = Some(format!("collect failed: {err}"));
                }
            }
        }

        let mut update = AttemptUpdate::status(updated.status)
            .with_operator_data(Value::Object(updated.operator_data.clone()));
        if let Some(external_id) = &updated.external_id {
            update = update.with_external_id(external_id.clone());
        }
        if let Some(reason) = &updated.reason {
            update = update.with_reason(reason.clone());
        }
        store.update_attempt(&attempt.attempt_id, update)?;
        store.update_task_status(&attempt.task_id, updated.status.task_status())?;

        if previous_status != updated.status {
            let context = hook_context(&run.run_id, &attempt);
            match updated.status {
                AttemptStatus::Completed => {
                    if let Some(hooks) = hooks {
                        fire_safely(|| hooks.on_complete(&context), "on_complete");
                    }
                }
                AttemptStatus::Failed | AttemptStatus::FailedInit => {
                    if let Some(hooks) = hooks {
                        let reason = updated
                            .reason
                            .clone()
                            .unwrap_or_else(|| "unknown error".to_string());
                        fire_safely(|| hooks.on_fail(&context, &reason), "on_fail");
                    }
                }
                _ => {}
            }
        }
    }

    poll_legacy_external_runs(store, run, registry)?;
    Ok(())
}

/// Back-compat: poll legacy v1 rows for tasks that have no attempts.
fn poll_legacy_external_runs(
    store: &StateStore,
    run: &RunHandle,
    registry: &OperatorRegistry,
) -> Result<(), EngineError> {
    let attempt_task_ids = store.attempt_task_ids(&run.run_id)?;
    for mut record in store.get_active_external_runs(&run.run_id)? {
        if attempt_task_ids.contains(&record.task_id) {
            continue;
        }
        let Some(operator) = registry.get(&record.operator_type) else {
            warn!(
                task_id = %record.task_id,
                operator_type = %record.operator_type,
                "legacy external run has no operator in registry"
            );
            record.status = AttemptStatus::Failed;
            store.update_external_run(&record)?;
            store.update_task_status(&record.task_id, AttemptStatus::Failed.task_status())?;
            continue;
        };

        let evidence_dir = match &record.relative_path {
            Some(rel) => run.root_path.join(rel),
            None => run.root_path.clone(),
        };
        let handle = OperatorHandle {
            task_id: record.task_id.clone(),
            attempt_id: String::new(),
            operator_key: record.operator_type.clone(),
            status: record.status,
            external_id: record.external_id.clone(),
            operator_data: match &record.operator_data {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            },
            evidence_dir,
            workdir_remote: None,
            reason: None,
        };

        let updated = match operator.check(&handle) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(task_id = %record.task_id, error = %err, "legacy poll failed");
                continue;
            }
        };
        let mut data = updated.operator_data.clone();
        if updated.status == AttemptStatus::Completed {
            if let Ok(outcome) = operator.collect(&updated) {
                merge_outcome(&mut data, &outcome);
            }
        }
        record.status = updated.status;
        record.external_id = updated.external_id.clone();
        record.operator_data = Value::Object(data);
        store.update_external_run(&record)?;
        store.update_task_status(&record.task_id, updated.status.task_status())?;
    }
    Ok(())
}

/// Map an operator boundary error to the attempt status it implies at
/// dispatch time: transients leave the attempt as-is.
pub(crate) fn dispatch_failure_status(err: &OperatorError) -> Option<AttemptStatus> {
    if err.is_transient() {
        None
    } else {
        Some(AttemptStatus::FailedInit)
    }
}
