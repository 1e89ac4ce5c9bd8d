//! One tick of the run lifecycle.

use tracing::{debug, info};

use matterstack_core::{Campaign, EngineError, RunConfig, RunHandle, RunStatus};
use matterstack_store::StateStore;

use crate::analyze::analyze_phase;
use crate::context::{build_registry_for_run, StepOptions};
use crate::dispatch::{execute_phase, plan_phase};
use crate::poll::poll_phase;

/// Execute one tick: POLL -> PLAN -> EXECUTE -> ANALYZE.
///
/// Stateless across ticks; acquires the run lock for the duration and never
/// blocks waiting for external work. Returns the run status after the tick.
///
/// - PAUSED runs still poll (in-flight work is observed) but never execute.
/// - CANCELLED runs poll so in-flight attempts reach a terminal state, but
///   neither execute nor analyze.
/// - COMPLETED/FAILED runs return immediately.
pub fn step_run(
    run: &RunHandle,
    campaign: &dyn Campaign,
    options: &StepOptions,
) -> Result<RunStatus, EngineError> {
    let store = StateStore::open(run.db_path()).map_err(EngineError::from)?;
    let _lock = store.lock().map_err(EngineError::from)?;

    let mut status = store
        .get_run_status(&run.run_id)?
        .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))?;

    if status == RunStatus::Pending {
        info!(run_id = %run.run_id, "run started");
        store.set_run_status(&run.run_id, RunStatus::Running, None)?;
        status = RunStatus::Running;
    }

    if matches!(status, RunStatus::Completed | RunStatus::Failed) {
        debug!(run_id = %run.run_id, status = status.as_str(), "run is terminal; skipping tick");
        return Ok(status);
    }

    let config = RunConfig::load(&run.config_path())?;
    let registry = build_registry_for_run(run, &store, options)?;
    let hooks = options.hooks.as_deref();

    // POLL: always runs for live, paused, and cancelled runs alike, so that
    // in-flight attempts are eventually observed to terminal.
    poll_phase(&store, run, &registry, &config, hooks)?;

    if status == RunStatus::Paused {
        debug!(run_id = %run.run_id, "run paused; skipping EXECUTE");
        return Ok(RunStatus::Paused);
    }
    if status == RunStatus::Cancelled {
        debug!(run_id = %run.run_id, "run cancelled; skipping EXECUTE");
        return Ok(RunStatus::Cancelled);
    }

    // PLAN.
    let tasks = store.get_tasks(&run.run_id)?;
    plan_phase(&store, run, &tasks)?;

    // EXECUTE.
    let submitted = execute_phase(&store, run, &registry, &config, hooks)?;
    if submitted > 0 {
        debug!(run_id = %run.run_id, submitted, "dispatched tasks this tick");
    }

    // ANALYZE over the refreshed view.
    let tasks = store.get_tasks(&run.run_id)?;
    analyze_phase(&store, run, campaign, &tasks)?;

    store
        .get_run_status(&run.run_id)?
        .ok_or_else(|| EngineError::RunNotFound(run.run_id.clone()))
}
