//! Shared tick context: options, wiring resolution, and registry building.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use matterstack_core::{EngineError, RunHandle};
use matterstack_runtime::{OperatorRegistry, RegistryOptions};
use matterstack_store::StateStore;
use matterstack_wiring::{
    resolve_operator_wiring, OperatorsConfig, WiringError, WiringRequest,
};

use crate::hooks::LifecycleHook;

pub const ENV_WORKSPACES_ROOT: &str = "MATTERSTACK_WORKSPACES_ROOT";

/// The workspaces base directory: `MATTERSTACK_WORKSPACES_ROOT` or
/// `./workspaces`.
pub fn workspaces_root() -> PathBuf {
    std::env::var(ENV_WORKSPACES_ROOT)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("workspaces"))
}

/// Options for one tick.
pub struct StepOptions {
    /// Pre-built registry; when None the registry is built from the run's
    /// wiring snapshot (resolving and persisting it first if needed).
    pub registry: Option<Arc<OperatorRegistry>>,
    pub wiring: WiringRequest,
    pub registry_options: RegistryOptions,
    pub hooks: Option<Arc<dyn LifecycleHook>>,
    /// Actor recorded on audit events produced by this tick.
    pub actor: String,
}

impl StepOptions {
    pub fn new() -> Self {
        Self {
            registry: None,
            wiring: WiringRequest::new(workspaces_root()),
            registry_options: RegistryOptions::default(),
            hooks: None,
            actor: "engine".to_string(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<OperatorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHook>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

impl Default for StepOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Wiring used when a run resolves no operators config at all: local compute
/// plus the file-exchange operators, everything on this machine.
const DEFAULT_WIRING: &str = "operators:
  local.default:
    kind: local
  hpc.default:
    kind: hpc
  human.default:
    kind: human
  experiment.default:
    kind: experiment
";

/// Resolve wiring for the run and build the tick's registry.
///
/// A forced wiring override is recorded as an audit event. Runs with no
/// resolvable wiring fall back to the built-in local registry.
pub fn build_registry_for_run(
    run: &RunHandle,
    store: &StateStore,
    options: &StepOptions,
) -> Result<Arc<OperatorRegistry>, EngineError> {
    if let Some(registry) = &options.registry {
        return Ok(registry.clone());
    }

    let config = match resolve_operator_wiring(run, &options.wiring) {
        Ok(resolved) => {
            if resolved.forced_override {
                store
                    .record_event(
                        &run.run_id,
                        "wiring_override_forced",
                        &options.actor,
                        serde_json::json!({
                            "sha256": resolved.sha256,
                            "resolved_path": resolved.resolved_path.display().to_string(),
                        }),
                    )
                    .map_err(EngineError::from)?;
            }
            OperatorsConfig::load(&resolved.snapshot_path)
                .map_err(|e| EngineError::Wiring(e.to_string()))?
        }
        Err(WiringError::Unresolved(_)) => {
            info!(run_id = %run.run_id, "no operator wiring found; using local defaults");
            OperatorsConfig::parse(DEFAULT_WIRING, "<builtin>")
                .map_err(|e| EngineError::Wiring(e.to_string()))?
        }
        Err(WiringError::OverrideRefused(detail)) => {
            return Err(EngineError::WiringOverride(detail))
        }
        Err(other) => return Err(EngineError::Wiring(other.to_string())),
    };

    let registry = OperatorRegistry::from_config(&config, run, &options.registry_options)
        .map_err(|e| EngineError::Wiring(e.to_string()))?;
    Ok(Arc::new(registry))
}
