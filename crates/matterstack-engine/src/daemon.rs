//! Blocking loops: single-run drive-to-completion and the multi-run daemon.

use std::path::Path;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use matterstack_core::{Campaign, EngineError, RunHandle, RunStatus};
use matterstack_store::StateStore;

use crate::context::StepOptions;
use crate::step::step_run;

/// Repeatedly tick a run until it reaches a terminal status.
///
/// PAUSED runs keep being polled at the same cadence; lock contention is
/// treated as "another process is driving this run" and retried.
pub fn run_until_completion(
    run: &RunHandle,
    campaign: &dyn Campaign,
    options: &StepOptions,
    tick_interval: Duration,
) -> Result<RunStatus, EngineError> {
    info!(run_id = %run.run_id, "entering run loop");
    loop {
        match step_run(run, campaign, options) {
            Ok(status) if status.is_terminal() => {
                info!(run_id = %run.run_id, status = status.as_str(), "run finished");
                return Ok(status);
            }
            Ok(status) => {
                debug!(run_id = %run.run_id, status = status.as_str(), "tick complete");
            }
            Err(EngineError::LockHeld { holder }) => {
                warn!(
                    run_id = %run.run_id,
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "run locked by another process; retrying"
                );
            }
            Err(other) => return Err(other),
        }
        std::thread::sleep(tick_interval);
    }
}

/// Scan the workspaces tree for runs in an active status.
pub fn list_active_runs(base_path: &Path) -> Vec<RunHandle> {
    let mut active = Vec::new();
    let Ok(workspaces) = std::fs::read_dir(base_path) else {
        return active;
    };
    for workspace in workspaces.flatten() {
        let runs_dir = workspace.path().join("runs");
        let Ok(runs) = std::fs::read_dir(&runs_dir) else {
            continue;
        };
        let slug = workspace.file_name().to_string_lossy().to_string();
        for run_dir in runs.flatten() {
            let root = run_dir.path();
            if !root.join("state.db").is_file() {
                continue;
            }
            let run_id = run_dir.file_name().to_string_lossy().to_string();
            let status = StateStore::open(root.join("state.db"))
                .ok()
                .and_then(|store| store.get_run_status(&run_id).ok().flatten());
            if matches!(status, Some(status) if status.is_active()) {
                active.push(RunHandle::new(slug.clone(), run_id, root));
            }
        }
    }
    active
}

/// One daemon sweep: tick every active run in randomized order, skipping
/// runs whose lock is held elsewhere. Randomization gives fairness across
/// runs without any global coordination. Returns the number of runs ticked.
pub fn service_active_runs(
    base_path: &Path,
    campaign_for: &dyn Fn(&RunHandle) -> Option<Box<dyn Campaign>>,
    options: &StepOptions,
) -> usize {
    let mut runs = list_active_runs(base_path);
    runs.shuffle(&mut rand::thread_rng());

    let mut ticked = 0;
    for run in runs {
        let Some(campaign) = campaign_for(&run) else {
            warn!(run_id = %run.run_id, "no campaign available for run; skipping");
            continue;
        };
        match step_run(&run, campaign.as_ref(), options) {
            Ok(status) => {
                debug!(run_id = %run.run_id, status = status.as_str(), "daemon tick");
                ticked += 1;
            }
            Err(EngineError::LockHeld { .. }) => {
                debug!(run_id = %run.run_id, "lock held elsewhere; skipping");
            }
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "daemon tick failed");
            }
        }
    }
    ticked
}
