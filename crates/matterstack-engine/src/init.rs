//! Run initialization and resumption.

use std::path::PathBuf;

use serde_json::json;
use tracing::{info, warn};

use matterstack_core::{
    generate_run_id, Campaign, EngineError, RunConfig, RunHandle, RunStatus,
};
use matterstack_store::StateStore;
use matterstack_wiring::{resolve_operator_wiring, WiringError, WiringRequest};

use crate::context::workspaces_root;

/// Options for initializing a run.
pub struct InitOptions {
    pub base_path: PathBuf,
    pub run_id: Option<String>,
    pub run_config: RunConfig,
    pub wiring: WiringRequest,
    pub tags: serde_json::Value,
    pub description: Option<String>,
}

impl InitOptions {
    pub fn new() -> Self {
        let base_path = workspaces_root();
        Self {
            wiring: WiringRequest::new(&base_path),
            base_path,
            run_id: None,
            run_config: RunConfig::default(),
            tags: json!({}),
            description: None,
        }
    }
}

impl Default for InitOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize a new run: directory layout, state store, wiring snapshot,
/// and the campaign's first workflow. Leaves the run RUNNING.
pub fn initialize_run(
    workspace_slug: &str,
    campaign: &dyn Campaign,
    options: &InitOptions,
) -> Result<RunHandle, EngineError> {
    let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
    let root_path = options
        .base_path
        .join(workspace_slug)
        .join("runs")
        .join(&run_id);
    std::fs::create_dir_all(&root_path)?;

    let handle = RunHandle::new(workspace_slug, run_id, &root_path);
    info!(run_id = %handle.run_id, root = %root_path.display(), "initializing run");

    options.run_config.save(&handle.config_path())?;

    let store = StateStore::open(handle.db_path()).map_err(EngineError::from)?;
    let _lock = store.lock().map_err(EngineError::from)?;
    store.create_run(
        &handle,
        RunStatus::Pending,
        options.tags.clone(),
        options.description.as_deref(),
    )?;

    // Pin the wiring snapshot now so every later tick resolves to the same
    // bytes. A run with no wiring at all falls back to local defaults at
    // step time.
    match resolve_operator_wiring(&handle, &options.wiring) {
        Ok(resolved) => {
            info!(sha256 = %resolved.sha256, source = ?resolved.source, "operator wiring pinned");
        }
        Err(WiringError::Unresolved(_)) => {
            warn!(run_id = %handle.run_id, "no operator wiring found during init");
        }
        Err(WiringError::OverrideRefused(detail)) => {
            return Err(EngineError::WiringOverride(detail))
        }
        Err(other) => return Err(EngineError::Wiring(other.to_string())),
    }

    match campaign.plan(None) {
        Ok(Some(workflow)) => {
            store.add_workflow(&workflow, &handle.run_id)?;
            info!(
                run_id = %handle.run_id,
                tasks = workflow.len(),
                "initial workflow persisted"
            );
        }
        Ok(None) => {
            info!(run_id = %handle.run_id, "campaign planned no initial work");
        }
        Err(err) => {
            let reason = format!("initial plan failed: {err}");
            store.set_run_status(&handle.run_id, RunStatus::Failed, Some(&reason))?;
            return Err(EngineError::Campaign(reason));
        }
    }

    store.set_run_status(&handle.run_id, RunStatus::Running, None)?;
    Ok(handle)
}

/// Initialize a new run or resume the workspace's latest one.
///
/// With an explicit `resume_run_id` the run is resumed if present, created
/// otherwise. Without one, the chronologically newest run is resumed when it
/// is active; a terminal latest run starts a new one unless `resume_always`.
pub fn initialize_or_resume_run(
    workspace_slug: &str,
    campaign: &dyn Campaign,
    options: &InitOptions,
    resume_run_id: Option<&str>,
    resume_always: bool,
) -> Result<RunHandle, EngineError> {
    let runs_dir = options.base_path.join(workspace_slug).join("runs");

    if let Some(run_id) = resume_run_id {
        let target = runs_dir.join(run_id);
        if target.is_dir() {
            info!(run_id = %run_id, "resuming explicit run");
            return Ok(RunHandle::new(workspace_slug, run_id, target));
        }
        let with_id = InitOptions {
            run_id: Some(run_id.to_string()),
            base_path: options.base_path.clone(),
            run_config: options.run_config.clone(),
            wiring: options.wiring.clone(),
            tags: options.tags.clone(),
            description: options.description.clone(),
        };
        return initialize_run(workspace_slug, campaign, &with_id);
    }

    // Run ids sort chronologically, so the lexicographically largest
    // directory is the newest run.
    let mut run_dirs: Vec<PathBuf> = match std::fs::read_dir(&runs_dir) {
        Ok(entries) => entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    };
    run_dirs.sort();
    let Some(latest) = run_dirs.pop() else {
        info!("no existing runs; starting a new one");
        return initialize_run(workspace_slug, campaign, options);
    };
    let latest_id = latest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let status = StateStore::open(latest.join("state.db"))
        .ok()
        .and_then(|store| store.get_run_status(&latest_id).ok().flatten());

    match status {
        Some(status) if status.is_active() => {
            info!(run_id = %latest_id, status = status.as_str(), "resuming active run");
            Ok(RunHandle::new(workspace_slug, latest_id, latest))
        }
        Some(status) if resume_always => {
            info!(run_id = %latest_id, status = status.as_str(), "resuming terminal run");
            Ok(RunHandle::new(workspace_slug, latest_id, latest))
        }
        Some(status) => {
            info!(
                run_id = %latest_id,
                status = status.as_str(),
                "latest run is terminal; starting a new one"
            );
            initialize_run(workspace_slug, campaign, options)
        }
        None => {
            warn!(run_id = %latest_id, "could not determine latest run status; starting new run");
            initialize_run(workspace_slug, campaign, options)
        }
    }
}
