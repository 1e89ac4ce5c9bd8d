//! Run identity and run-scoped configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Handle identifying one run: workspace, id, and root directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub workspace_slug: String,
    pub run_id: String,
    pub root_path: PathBuf,
}

impl RunHandle {
    pub fn new(
        workspace_slug: impl Into<String>,
        run_id: impl Into<String>,
        root_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspace_slug: workspace_slug.into(),
            run_id: run_id.into(),
            root_path: root_path.into(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root_path.join("state.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root_path.join("run.lock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root_path.join("config.json")
    }

    pub fn campaign_state_path(&self) -> PathBuf {
        self.root_path.join("campaign_state.json")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root_path.join("operators_snapshot")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.root_path.join("evidence")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root_path.join("tasks")
    }

    /// Evidence directory for one attempt:
    /// `tasks/<task_id>/attempts/<attempt_id>/`.
    pub fn attempt_dir(&self, task_id: &str, attempt_id: &str) -> PathBuf {
        self.tasks_dir()
            .join(task_id)
            .join("attempts")
            .join(attempt_id)
    }
}

/// How compute tasks without explicit routing are executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Complete compute tasks without dispatch; used for workflow verification.
    #[default]
    Simulation,
    Local,
    Hpc,
}

/// Run-scoped configuration persisted as `config.json` under the run root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_max_concurrent_global")]
    pub max_concurrent_global: usize,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Routing target for tasks with no operator_key and no env override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_operator: Option<String>,
    #[serde(default = "default_stuck_timeout")]
    pub stuck_attempt_timeout_seconds: u64,
}

fn default_max_concurrent_global() -> usize {
    50
}

fn default_stuck_timeout() -> u64 {
    3600
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_concurrent_global: default_max_concurrent_global(),
            execution_mode: ExecutionMode::default(),
            default_operator: None,
            stuck_attempt_timeout_seconds: default_stuck_timeout(),
        }
    }
}

impl RunConfig {
    /// Load from `config.json`, falling back to defaults when the file is
    /// absent. A malformed file is an error, not a silent default.
    pub fn load(path: &Path) -> Result<Self, crate::error::CoreError> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::error::CoreError::Config(format!("read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            crate::error::CoreError::Config(format!("parse {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), crate::error::CoreError> {
        let raw = serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::CoreError::Config(format!("encode run config: {e}"))
        })?;
        std::fs::write(path, raw).map_err(|e| {
            crate::error::CoreError::Config(format!("write {}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_dir_layout() {
        let handle = RunHandle::new("ws", "20240101_000000_abcd1234", "/tmp/run");
        assert_eq!(
            handle.attempt_dir("t1", "a1"),
            PathBuf::from("/tmp/run/tasks/t1/attempts/a1")
        );
        assert_eq!(handle.db_path(), PathBuf::from("/tmp/run/state.db"));
    }

    #[test]
    fn run_config_defaults() {
        let cfg: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_concurrent_global, 50);
        assert_eq!(cfg.execution_mode, ExecutionMode::Simulation);
        assert_eq!(cfg.stuck_attempt_timeout_seconds, 3600);
    }

    #[test]
    fn run_config_rejects_unknown_fields() {
        let err = serde_json::from_str::<RunConfig>("{\"max_hpc\": 3}");
        assert!(err.is_err());
    }
}
