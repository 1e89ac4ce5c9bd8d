//! Operator registry: a factory table keyed by kind.
//!
//! The registry is built once per tick from the run's wiring snapshot and is
//! immutable for the tick's duration. Lookup accepts canonical keys and
//! legacy aliases ("HPC" resolves to `hpc.default`). New operator kinds plug
//! in by registering a factory; nothing above this layer changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use matterstack_core::{legacy_operator_type_to_key, normalize_operator_key, RunHandle};
use matterstack_wiring::{
    BackendConfig, OperatorInstanceConfig, OperatorsConfig, SshConfig, WiringConfigError,
};

use crate::backend::{ComputeBackend, LocalBackend, SlurmBackend, SshCliTransport};
use crate::compute::ComputeOperator;
use crate::experiment::ExperimentOperator;
use crate::human::HumanOperator;
use crate::operator::Operator;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no factory registered for operator kind {0:?}")]
    UnknownKind(String),
    #[error("failed to build operator {key}: {detail}")]
    Build { key: String, detail: String },
    #[error(transparent)]
    Config(#[from] WiringConfigError),
}

/// Extra inputs some factories need (profile resolution).
#[derive(Clone, Debug, Default)]
pub struct RegistryOptions {
    pub profiles_config_path: Option<PathBuf>,
}

/// A constructed operator plus its backend-derived metadata.
pub struct BuiltOperator {
    pub operator: Arc<dyn Operator>,
    /// Remote workspace root for backends that stage work off-machine.
    pub remote_root: Option<String>,
}

pub type OperatorFactory = Box<
    dyn Fn(&str, &OperatorInstanceConfig, &RunHandle, &RegistryOptions) -> Result<BuiltOperator, RegistryError>
        + Send
        + Sync,
>;

struct RegisteredOperator {
    operator: Arc<dyn Operator>,
    remote_root: Option<String>,
    max_concurrent: Option<u32>,
}

/// Immutable per-tick mapping from canonical keys to operator instances.
pub struct OperatorRegistry {
    operators: BTreeMap<String, RegisteredOperator>,
    max_concurrent_global: Option<u32>,
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.operators.keys().collect::<Vec<_>>())
            .field("max_concurrent_global", &self.max_concurrent_global)
            .finish()
    }
}

impl OperatorRegistry {
    /// Build a registry from parsed wiring using the built-in factories.
    pub fn from_config(
        config: &OperatorsConfig,
        run: &RunHandle,
        options: &RegistryOptions,
    ) -> Result<Self, RegistryError> {
        Self::from_config_with_factories(config, run, options, builtin_factories())
    }

    /// Build with a custom factory table (extension point for new kinds).
    pub fn from_config_with_factories(
        config: &OperatorsConfig,
        run: &RunHandle,
        options: &RegistryOptions,
        factories: BTreeMap<String, OperatorFactory>,
    ) -> Result<Self, RegistryError> {
        let mut operators = BTreeMap::new();
        for (key, instance) in &config.operators {
            let kind = instance.kind.as_str();
            let factory = factories
                .get(kind)
                .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))?;
            let built = factory(key, instance, run, options)?;
            debug!(key = %key, kind = %kind, "registered operator");
            operators.insert(
                key.clone(),
                RegisteredOperator {
                    operator: built.operator,
                    remote_root: built.remote_root,
                    max_concurrent: instance.max_concurrent,
                },
            );
        }
        Ok(Self {
            operators,
            max_concurrent_global: config.defaults.max_concurrent_global,
        })
    }

    /// Resolve a routing string (canonical key or legacy alias) to the
    /// canonical key of a registered operator.
    pub fn resolve_key(&self, raw: &str) -> Option<String> {
        if let Ok(key) = normalize_operator_key(raw) {
            if self.operators.contains_key(&key) {
                return Some(key);
            }
        }
        let mapped = legacy_operator_type_to_key(raw)?;
        self.operators.contains_key(&mapped).then_some(mapped)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Operator>> {
        let canonical = self.resolve_key(key)?;
        self.operators.get(&canonical).map(|r| r.operator.clone())
    }

    pub fn remote_root(&self, key: &str) -> Option<String> {
        let canonical = self.resolve_key(key)?;
        self.operators
            .get(&canonical)
            .and_then(|r| r.remote_root.clone())
    }

    /// Per-operator concurrency cap; None inherits the global limit.
    pub fn max_concurrent(&self, key: &str) -> Option<u32> {
        let canonical = self.resolve_key(key)?;
        self.operators
            .get(&canonical)
            .and_then(|r| r.max_concurrent)
    }

    pub fn max_concurrent_global(&self) -> Option<u32> {
        self.max_concurrent_global
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Legacy single-backend file shape (host + workspace, optional slurm opts).
#[derive(Deserialize)]
struct LegacyBackendFile {
    host: String,
    user: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    key_path: Option<String>,
    workspace_root: String,
    #[serde(default)]
    slurm: BTreeMap<String, serde_yaml::Value>,
}

fn default_port() -> u16 {
    22
}

fn yaml_value_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}

fn slurm_options(map: &BTreeMap<String, serde_yaml::Value>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), yaml_value_to_string(v)))
        .collect()
}

fn build_slurm_backend(
    ssh: &SshConfig,
    workspace_root: &str,
    slurm: &BTreeMap<String, serde_yaml::Value>,
) -> (Arc<dyn ComputeBackend>, Option<String>) {
    let transport = SshCliTransport::new(ssh.clone());
    let backend = SlurmBackend::new(Box::new(transport), slurm_options(slurm));
    (Arc::new(backend), Some(workspace_root.to_string()))
}

fn resolve_profile_backend(
    key: &str,
    name: &str,
    options: &RegistryOptions,
) -> Result<BackendConfig, RegistryError> {
    let path = options.profiles_config_path.as_ref().ok_or_else(|| {
        RegistryError::Build {
            key: key.to_string(),
            detail: format!("backend profile {name:?} requested but no profiles config is set"),
        }
    })?;
    let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::Build {
        key: key.to_string(),
        detail: format!("read profiles config {}: {e}", path.display()),
    })?;

    #[derive(Deserialize)]
    struct ProfilesFile {
        profiles: BTreeMap<String, serde_yaml::Value>,
    }
    let file: ProfilesFile = serde_yaml::from_str(&raw).map_err(|e| RegistryError::Build {
        key: key.to_string(),
        detail: format!("parse profiles config {}: {e}", path.display()),
    })?;
    let value = file.profiles.get(name).ok_or_else(|| RegistryError::Build {
        key: key.to_string(),
        detail: format!("profile {name:?} not found in {}", path.display()),
    })?;

    let backend = BackendConfig::from_yaml(
        value.clone(),
        &format!("profiles.{name}"),
        &path.display().to_string(),
    )?;
    if matches!(backend, BackendConfig::Profile { .. } | BackendConfig::Legacy { .. }) {
        return Err(RegistryError::Build {
            key: key.to_string(),
            detail: format!("profile {name:?} must resolve to a concrete backend"),
        });
    }
    Ok(backend)
}

fn build_compute_backend(
    key: &str,
    backend: &BackendConfig,
    run: &RunHandle,
    options: &RegistryOptions,
) -> Result<(Arc<dyn ComputeBackend>, Option<String>), RegistryError> {
    match backend {
        BackendConfig::Local { dry_run, .. } => {
            Ok((Arc::new(LocalBackend::new(*dry_run)), None))
        }
        BackendConfig::Slurm {
            workspace_root,
            ssh,
            slurm,
        } => Ok(build_slurm_backend(ssh, workspace_root, slurm)),
        BackendConfig::Profile { name } => {
            let resolved = resolve_profile_backend(key, name, options)?;
            build_compute_backend(key, &resolved, run, options)
        }
        BackendConfig::Legacy { path } => {
            let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::Build {
                key: key.to_string(),
                detail: format!("read legacy backend config {path}: {e}"),
            })?;
            let legacy: LegacyBackendFile =
                serde_yaml::from_str(&raw).map_err(|e| RegistryError::Build {
                    key: key.to_string(),
                    detail: format!("parse legacy backend config {path}: {e}"),
                })?;
            let ssh = SshConfig {
                host: legacy.host,
                user: legacy.user,
                port: legacy.port,
                key_path: legacy.key_path,
            };
            Ok(build_slurm_backend(&ssh, &legacy.workspace_root, &legacy.slurm))
        }
    }
}

fn compute_factory(kind: &'static str) -> OperatorFactory {
    Box::new(move |key, instance, run, options| {
        let backend_cfg = instance.backend.clone().unwrap_or(BackendConfig::Local {
            workspace_root: None,
            dry_run: false,
        });
        let (backend, remote_root) = build_compute_backend(key, &backend_cfg, run, options)?;
        Ok(BuiltOperator {
            operator: Arc::new(ComputeOperator::new(backend, kind)),
            remote_root,
        })
    })
}

/// The built-in factory table: hpc, local, human, experiment.
pub fn builtin_factories() -> BTreeMap<String, OperatorFactory> {
    let mut factories: BTreeMap<String, OperatorFactory> = BTreeMap::new();
    factories.insert("hpc".to_string(), compute_factory("hpc"));
    factories.insert("local".to_string(), compute_factory("local"));
    factories.insert(
        "human".to_string(),
        Box::new(|_key, _instance, _run, _options| {
            Ok(BuiltOperator {
                operator: Arc::new(HumanOperator::new()),
                remote_root: None,
            })
        }),
    );
    factories.insert(
        "experiment".to_string(),
        Box::new(|_key, _instance, _run, _options| {
            Ok(BuiltOperator {
                operator: Arc::new(ExperimentOperator::new()),
                remote_root: None,
            })
        }),
    );
    factories
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handle() -> (tempfile::TempDir, RunHandle) {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("ws", "r1", dir.path());
        (dir, run)
    }

    #[test]
    fn builds_all_builtin_kinds() {
        let (_dir, run) = run_handle();
        let yaml = r#"
defaults:
  max_concurrent_global: 10
operators:
  hpc.default:
    kind: hpc
    max_concurrent: 3
    backend:
      type: slurm
      workspace_root: /scratch/ms
      ssh: {host: login, user: ms}
  local.default:
    kind: local
  human.default:
    kind: human
  experiment.default:
    kind: experiment
"#;
        let config = OperatorsConfig::parse(yaml, "operators.yaml").unwrap();
        let registry =
            OperatorRegistry::from_config(&config, &run, &RegistryOptions::default()).unwrap();

        assert_eq!(registry.keys().count(), 4);
        assert!(registry.get("hpc.default").is_some());
        assert_eq!(registry.max_concurrent("hpc.default"), Some(3));
        assert_eq!(registry.max_concurrent("local.default"), None);
        assert_eq!(registry.max_concurrent_global(), Some(10));
        assert_eq!(
            registry.remote_root("hpc.default").as_deref(),
            Some("/scratch/ms")
        );
        assert!(registry.remote_root("local.default").is_none());
    }

    #[test]
    fn legacy_aliases_resolve_to_canonical_keys() {
        let (_dir, run) = run_handle();
        let yaml = r#"
operators:
  hpc.default:
    kind: hpc
  human.default:
    kind: human
"#;
        let config = OperatorsConfig::parse(yaml, "operators.yaml").unwrap();
        let registry =
            OperatorRegistry::from_config(&config, &run, &RegistryOptions::default()).unwrap();

        assert_eq!(registry.resolve_key("HPC").as_deref(), Some("hpc.default"));
        assert_eq!(
            registry.resolve_key("Human").as_deref(),
            Some("human.default")
        );
        assert!(registry.get("HPC").is_some());
        assert!(registry.resolve_key("Local").is_none());
        assert!(registry.resolve_key("robot.default").is_none());
    }

    #[test]
    fn profile_backend_resolves_through_profiles_file() {
        let (dir, run) = run_handle();
        let profiles = dir.path().join("profiles.yaml");
        std::fs::write(
            &profiles,
            r#"
profiles:
  cluster-a:
    type: slurm
    workspace_root: /scratch/a
    ssh: {host: a.example, user: ms}
"#,
        )
        .unwrap();

        let yaml = r#"
operators:
  hpc.default:
    kind: hpc
    backend:
      type: profile
      name: cluster-a
"#;
        let config = OperatorsConfig::parse(yaml, "operators.yaml").unwrap();
        let options = RegistryOptions {
            profiles_config_path: Some(profiles),
        };
        let registry = OperatorRegistry::from_config(&config, &run, &options).unwrap();
        assert_eq!(
            registry.remote_root("hpc.default").as_deref(),
            Some("/scratch/a")
        );
    }

    #[test]
    fn missing_profile_is_a_build_error() {
        let (dir, run) = run_handle();
        let profiles = dir.path().join("profiles.yaml");
        std::fs::write(&profiles, "profiles: {}\n").unwrap();

        let yaml = r#"
operators:
  hpc.default:
    kind: hpc
    backend:
      type: profile
      name: ghost
"#;
        let config = OperatorsConfig::parse(yaml, "operators.yaml").unwrap();
        let options = RegistryOptions {
            profiles_config_path: Some(profiles),
        };
        let err = OperatorRegistry::from_config(&config, &run, &options).unwrap_err();
        assert!(matches!(err, RegistryError::Build { .. }));
    }
}
