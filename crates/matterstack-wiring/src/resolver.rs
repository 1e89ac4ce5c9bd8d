//! Wiring resolution and run-local snapshot persistence.
//!
//! The first resolution for a run copies the winning config into
//! `<run_root>/operators_snapshot/` and pins its sha256. Every later
//! resolution reuses that snapshot, so a resumed run sees byte-identical
//! wiring with zero flags. Changing the wiring of an existing run requires
//! an explicit path plus `force`, and leaves an audit trail.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use matterstack_core::RunHandle;

pub const ENV_OPERATORS_CONFIG: &str = "MATTERSTACK_OPERATORS_CONFIG";

#[derive(Debug, Error)]
pub enum WiringError {
    /// Override of persisted wiring without force. Nothing is mutated, not
    /// even the history log.
    #[error("refusing to override persisted operator wiring: {0}")]
    OverrideRefused(String),
    #[error("operators config file not found: {0}")]
    NotFound(String),
    #[error("wiring io error: {0}")]
    Io(String),
    #[error("no operator wiring could be resolved for workspace {0:?}")]
    Unresolved(String),
}

/// Where the effective wiring came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WiringSource {
    Explicit,
    RunPersisted,
    WorkspaceDefault,
    EnvVar,
    Legacy,
}

/// Result of resolving wiring for a run.
#[derive(Clone, Debug)]
pub struct ResolvedWiring {
    pub source: WiringSource,
    /// Origin path that produced the snapshot (the snapshot itself for
    /// RUN_PERSISTED resolutions).
    pub resolved_path: PathBuf,
    pub sha256: String,
    /// Authoritative path used to build the registry.
    pub snapshot_path: PathBuf,
    /// True when this call replaced existing wiring under force.
    pub forced_override: bool,
}

/// Inputs to a resolution. `env_config_path` is captured from the
/// environment by [`WiringRequest::new`] so tests can inject it directly.
#[derive(Clone, Debug)]
pub struct WiringRequest {
    pub explicit_path: Option<PathBuf>,
    pub force: bool,
    pub workspaces_root: PathBuf,
    pub env_config_path: Option<PathBuf>,
    pub legacy_config_path: Option<PathBuf>,
}

impl WiringRequest {
    pub fn new(workspaces_root: impl Into<PathBuf>) -> Self {
        Self {
            explicit_path: None,
            force: false,
            workspaces_root: workspaces_root.into(),
            env_config_path: std::env::var(ENV_OPERATORS_CONFIG).ok().map(PathBuf::from),
            legacy_config_path: None,
        }
    }

    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotMetadata {
    source: WiringSource,
    resolved_path: String,
    sha256: String,
    created_at: String,
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn snapshot_paths(run_root: &Path) -> (PathBuf, PathBuf, PathBuf, PathBuf) {
    let dir = run_root.join("operators_snapshot");
    let yaml = dir.join("operators.yaml");
    let metadata = dir.join("metadata.json");
    let history = dir.join("history.jsonl");
    (dir, yaml, metadata, history)
}

fn append_history(
    history_path: &Path,
    event: &str,
    source: WiringSource,
    sha256: &str,
    resolved_path: &Path,
) -> Result<(), WiringError> {
    use std::io::Write;
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| WiringError::Io(e.to_string()))?;
    }
    let line = serde_json::json!({
        "at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "event": event,
        "source": source,
        "sha256": sha256,
        "resolved_path": resolved_path.display().to_string(),
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(history_path)
        .map_err(|e| WiringError::Io(e.to_string()))?;
    writeln!(file, "{line}").map_err(|e| WiringError::Io(e.to_string()))?;
    Ok(())
}

fn write_metadata(
    metadata_path: &Path,
    source: WiringSource,
    resolved_path: &Path,
    sha256: &str,
) -> Result<(), WiringError> {
    let metadata = SnapshotMetadata {
        source,
        resolved_path: resolved_path.display().to_string(),
        sha256: sha256.to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    let raw = serde_json::to_string_pretty(&metadata)
        .map_err(|e| WiringError::Io(e.to_string()))?;
    std::fs::write(metadata_path, raw + "\n").map_err(|e| WiringError::Io(e.to_string()))
}

fn persist_snapshot(
    run_root: &Path,
    source: WiringSource,
    resolved_path: &Path,
    bytes: &[u8],
    allow_override: bool,
) -> Result<ResolvedWiring, WiringError> {
    let (dir, yaml, metadata, history) = snapshot_paths(run_root);
    std::fs::create_dir_all(&dir).map_err(|e| WiringError::Io(e.to_string()))?;

    let desired_sha = sha256_hex(bytes);
    let existing_sha = match std::fs::read(&yaml) {
        Ok(existing) => Some(sha256_hex(&existing)),
        Err(_) => None,
    };

    match existing_sha {
        Some(existing) if existing != desired_sha => {
            if !allow_override {
                return Err(WiringError::OverrideRefused(format!(
                    "run snapshot {} (sha256 {existing}) differs from {} (sha256 {desired_sha}); \
                     pass force to replace it",
                    yaml.display(),
                    resolved_path.display(),
                )));
            }
            warn!(
                snapshot = %yaml.display(),
                prior = %existing,
                new = %desired_sha,
                "forcing operator wiring override"
            );
            std::fs::write(&yaml, bytes).map_err(|e| WiringError::Io(e.to_string()))?;
            write_metadata(&metadata, source, resolved_path, &desired_sha)?;
            append_history(&history, "WIRING_OVERRIDE_FORCED", source, &desired_sha, resolved_path)?;
            Ok(ResolvedWiring {
                source,
                resolved_path: resolved_path.to_path_buf(),
                sha256: desired_sha,
                snapshot_path: yaml,
                forced_override: true,
            })
        }
        Some(_) => Ok(ResolvedWiring {
            // Same content; a pure read regardless of where it came from.
            source,
            resolved_path: resolved_path.to_path_buf(),
            sha256: desired_sha,
            snapshot_path: yaml,
            forced_override: false,
        }),
        None => {
            std::fs::write(&yaml, bytes).map_err(|e| WiringError::Io(e.to_string()))?;
            write_metadata(&metadata, source, resolved_path, &desired_sha)?;
            append_history(&history, "WIRING_PERSISTED", source, &desired_sha, resolved_path)?;
            info!(
                snapshot = %yaml.display(),
                sha256 = %desired_sha,
                source = ?source,
                "persisted operator wiring snapshot"
            );
            Ok(ResolvedWiring {
                source,
                resolved_path: resolved_path.to_path_buf(),
                sha256: desired_sha,
                snapshot_path: yaml,
                forced_override: false,
            })
        }
    }
}

fn read_required(path: &Path, what: &str) -> Result<Vec<u8>, WiringError> {
    if !path.is_file() {
        return Err(WiringError::NotFound(format!(
            "{what}: {}",
            path.display()
        )));
    }
    std::fs::read(path).map_err(|e| WiringError::Io(format!("read {}: {e}", path.display())))
}

/// Synthesize a canonical snapshot wrapping a legacy single-backend config.
fn legacy_snapshot_bytes(legacy_path: &Path) -> Vec<u8> {
    format!(
        "operators:\n  hpc.default:\n    kind: hpc\n    backend:\n      type: legacy\n      path: {}\n  local.default:\n    kind: local\n",
        legacy_path.display()
    )
    .into_bytes()
}

/// Resolve operator wiring for a run by precedence and ensure a run-local
/// snapshot exists.
///
/// Precedence (highest first): explicit path, run snapshot, workspace
/// default, `MATTERSTACK_OPERATORS_CONFIG`, legacy config. An explicit path
/// that differs from an existing snapshot requires `force`; the refusal
/// leaves snapshot, metadata, and history untouched.
pub fn resolve_operator_wiring(
    run: &RunHandle,
    request: &WiringRequest,
) -> Result<ResolvedWiring, WiringError> {
    let run_root = &run.root_path;
    let (_dir, snapshot_yaml, _metadata, _history) = snapshot_paths(run_root);

    // 1) Explicit override.
    if let Some(explicit) = &request.explicit_path {
        let bytes = read_required(explicit, "explicit operators config")?;
        return persist_snapshot(
            run_root,
            WiringSource::Explicit,
            explicit,
            &bytes,
            request.force,
        );
    }

    // 2) Run-persisted snapshot: a pure read.
    if snapshot_yaml.is_file() {
        let bytes =
            std::fs::read(&snapshot_yaml).map_err(|e| WiringError::Io(e.to_string()))?;
        return Ok(ResolvedWiring {
            source: WiringSource::RunPersisted,
            resolved_path: snapshot_yaml.clone(),
            sha256: sha256_hex(&bytes),
            snapshot_path: snapshot_yaml,
            forced_override: false,
        });
    }

    // 3) Workspace default.
    let workspace_default = request
        .workspaces_root
        .join(&run.workspace_slug)
        .join("operators.yaml");
    if workspace_default.is_file() {
        let bytes = std::fs::read(&workspace_default)
            .map_err(|e| WiringError::Io(e.to_string()))?;
        return persist_snapshot(
            run_root,
            WiringSource::WorkspaceDefault,
            &workspace_default,
            &bytes,
            false,
        );
    }

    // 4) Environment-configured path.
    if let Some(env_path) = &request.env_config_path {
        let bytes = read_required(env_path, ENV_OPERATORS_CONFIG)?;
        return persist_snapshot(run_root, WiringSource::EnvVar, env_path, &bytes, false);
    }

    // 5) Legacy single-backend config, converted to a canonical snapshot.
    if let Some(legacy) = &request.legacy_config_path {
        read_required(legacy, "legacy backend config")?;
        let bytes = legacy_snapshot_bytes(legacy);
        return persist_snapshot(run_root, WiringSource::Legacy, legacy, &bytes, false);
    }

    Err(WiringError::Unresolved(run.workspace_slug.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_A: &str = "operators:\n  local.default:\n    kind: local\n";
    const CONFIG_B: &str = "operators:\n  human.default:\n    kind: human\n";

    fn setup() -> (tempfile::TempDir, RunHandle, WiringRequest) {
        let dir = tempfile::tempdir().unwrap();
        let run_root = dir.path().join("ws/runs/r1");
        std::fs::create_dir_all(&run_root).unwrap();
        let handle = RunHandle::new("ws", "r1", &run_root);
        let mut request = WiringRequest::new(dir.path());
        request.env_config_path = None;
        (dir, handle, request)
    }

    #[test]
    fn workspace_default_is_persisted_then_reused() {
        let (dir, handle, request) = setup();
        let ws_config = dir.path().join("ws/operators.yaml");
        std::fs::write(&ws_config, CONFIG_A).unwrap();

        let first = resolve_operator_wiring(&handle, &request).unwrap();
        assert_eq!(first.source, WiringSource::WorkspaceDefault);
        assert!(first.snapshot_path.is_file());

        // Mutating the workspace default must not change the run's wiring.
        std::fs::write(&ws_config, CONFIG_B).unwrap();
        let second = resolve_operator_wiring(&handle, &request).unwrap();
        assert_eq!(second.source, WiringSource::RunPersisted);
        assert_eq!(second.sha256, first.sha256);
        assert_eq!(second.snapshot_path, first.snapshot_path);
    }

    #[test]
    fn explicit_path_beats_workspace_default() {
        let (dir, handle, mut request) = setup();
        std::fs::write(dir.path().join("ws/operators.yaml"), CONFIG_A).unwrap();
        let explicit = dir.path().join("override.yaml");
        std::fs::write(&explicit, CONFIG_B).unwrap();
        request.explicit_path = Some(explicit.clone());

        let resolved = resolve_operator_wiring(&handle, &request).unwrap();
        assert_eq!(resolved.source, WiringSource::Explicit);
        let snapshot = std::fs::read_to_string(&resolved.snapshot_path).unwrap();
        assert_eq!(snapshot, CONFIG_B);
    }

    #[test]
    fn env_var_path_is_used_when_nothing_else_matches() {
        let (dir, handle, mut request) = setup();
        let env_config = dir.path().join("env.yaml");
        std::fs::write(&env_config, CONFIG_A).unwrap();
        request.env_config_path = Some(env_config);

        let resolved = resolve_operator_wiring(&handle, &request).unwrap();
        assert_eq!(resolved.source, WiringSource::EnvVar);
    }

    #[test]
    fn override_without_force_is_refused_and_mutates_nothing() {
        let (dir, handle, mut request) = setup();
        std::fs::write(dir.path().join("ws/operators.yaml"), CONFIG_A).unwrap();
        let first = resolve_operator_wiring(&handle, &request).unwrap();

        let history_before =
            std::fs::read_to_string(handle.snapshot_dir().join("history.jsonl")).unwrap();

        let other = dir.path().join("other.yaml");
        std::fs::write(&other, CONFIG_B).unwrap();
        request.explicit_path = Some(other);

        let err = resolve_operator_wiring(&handle, &request).unwrap_err();
        assert!(matches!(err, WiringError::OverrideRefused(_)));

        // Snapshot bytes and history are untouched.
        let snapshot = std::fs::read_to_string(&first.snapshot_path).unwrap();
        assert_eq!(snapshot, CONFIG_A);
        let history_after =
            std::fs::read_to_string(handle.snapshot_dir().join("history.jsonl")).unwrap();
        assert_eq!(history_before, history_after);
    }

    #[test]
    fn forced_override_replaces_snapshot_and_logs_history() {
        let (dir, handle, mut request) = setup();
        std::fs::write(dir.path().join("ws/operators.yaml"), CONFIG_A).unwrap();
        resolve_operator_wiring(&handle, &request).unwrap();

        let other = dir.path().join("other.yaml");
        std::fs::write(&other, CONFIG_B).unwrap();
        request.explicit_path = Some(other);
        request.force = true;

        let resolved = resolve_operator_wiring(&handle, &request).unwrap();
        assert!(resolved.forced_override);
        assert_eq!(
            std::fs::read_to_string(&resolved.snapshot_path).unwrap(),
            CONFIG_B
        );
        let history =
            std::fs::read_to_string(handle.snapshot_dir().join("history.jsonl")).unwrap();
        assert!(history.contains("WIRING_OVERRIDE_FORCED"));
    }

    #[test]
    fn identical_content_yields_identical_hash_across_sources() {
        let (dir, handle, mut request) = setup();
        std::fs::write(dir.path().join("ws/operators.yaml"), CONFIG_A).unwrap();
        let from_workspace = resolve_operator_wiring(&handle, &request).unwrap();

        // Explicit override with the same bytes is a no-op, not a conflict.
        let same = dir.path().join("same.yaml");
        std::fs::write(&same, CONFIG_A).unwrap();
        request.explicit_path = Some(same);
        let from_explicit = resolve_operator_wiring(&handle, &request).unwrap();

        assert_eq!(from_workspace.sha256, from_explicit.sha256);
        assert!(!from_explicit.forced_override);
    }

    #[test]
    fn unresolved_when_no_source_exists() {
        let (_dir, handle, request) = setup();
        let err = resolve_operator_wiring(&handle, &request).unwrap_err();
        assert!(matches!(err, WiringError::Unresolved(_)));
    }

    #[test]
    fn legacy_config_synthesizes_canonical_snapshot() {
        let (dir, handle, mut request) = setup();
        let legacy = dir.path().join("cluster.yaml");
        std::fs::write(&legacy, "host: login\nuser: ms\n").unwrap();
        request.legacy_config_path = Some(legacy);

        let resolved = resolve_operator_wiring(&handle, &request).unwrap();
        assert_eq!(resolved.source, WiringSource::Legacy);
        let snapshot = std::fs::read_to_string(&resolved.snapshot_path).unwrap();
        assert!(snapshot.contains("hpc.default"));
        assert!(snapshot.contains("type: legacy"));
    }
}
