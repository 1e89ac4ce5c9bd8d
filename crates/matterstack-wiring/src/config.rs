//! Canonical operators.yaml schema.
//!
//! ```yaml
//! defaults:
//!   max_concurrent_global: 50
//! operators:
//!   hpc.default:
//!     kind: hpc
//!     max_concurrent: 5
//!     backend:
//!       type: slurm
//!       workspace_root: /scratch/ms
//!       ssh: {host: login.cluster, user: ms}
//! ```
//!
//! Keys must already be canonical (`kind.name`, lowercase); the `kind` field
//! must match the key's kind; unknown kinds, backend types, and fields fail
//! fast with the offending path in the error.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use matterstack_core::{normalize_operator_key, split_operator_key};

#[derive(Debug, Error)]
pub enum WiringConfigError {
    #[error("{path}: failed to parse YAML: {detail}")]
    Parse { path: String, detail: String },
    #[error("{path}: {detail}")]
    Invalid { path: String, detail: String },
    #[error("operators config file not found: {0}")]
    NotFound(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorKind {
    Hpc,
    Local,
    Human,
    Experiment,
}

impl OperatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hpc => "hpc",
            Self::Local => "local",
            Self::Human => "human",
            Self::Experiment => "experiment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hpc" => Some(Self::Hpc),
            "local" => Some(Self::Local),
            "human" => Some(Self::Human),
            "experiment" => Some(Self::Experiment),
            _ => None,
        }
    }

    pub fn is_compute(self) -> bool {
        matches!(self, Self::Hpc | Self::Local)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Compute backend selection, discriminated by `type`.
#[derive(Clone, Debug, PartialEq)]
pub enum BackendConfig {
    Local {
        /// Defaults to the run root when omitted, keeping configs portable.
        workspace_root: Option<String>,
        dry_run: bool,
    },
    Slurm {
        workspace_root: String,
        ssh: SshConfig,
        slurm: BTreeMap<String, serde_yaml::Value>,
    },
    /// Named execution profile resolved elsewhere.
    Profile { name: String },
    /// Old single-backend configuration file, kept for migration.
    Legacy { path: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLocalBackend {
    #[serde(default)]
    workspace_root: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSlurmBackend {
    workspace_root: String,
    ssh: SshConfig,
    #[serde(default)]
    slurm: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProfileBackend {
    name: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLegacyBackend {
    path: String,
}

impl BackendConfig {
    /// Deserialize from a YAML mapping, dispatching on `type` by hand so that
    /// unknown fields in every variant are rejected with a precise error.
    pub fn from_yaml(value: Value, at: &str, path: &str) -> Result<Self, WiringConfigError> {
        let invalid = |detail: String| WiringConfigError::Invalid {
            path: path.to_string(),
            detail,
        };

        let Value::Mapping(mut map) = value else {
            return Err(invalid(format!("{at}: backend must be a mapping")));
        };
        let type_key = Value::String("type".to_string());
        let backend_type = match map.remove(&type_key) {
            Some(Value::String(s)) => s,
            Some(_) => return Err(invalid(format!("{at}: backend.type must be a string"))),
            None => return Err(invalid(format!("{at}: backend is missing 'type'"))),
        };

        let rest = Value::Mapping(map);
        let decode_err =
            |e: serde_yaml::Error| invalid(format!("{at}: invalid backend.{backend_type}: {e}"));
        match backend_type.as_str() {
            "local" => {
                let raw: RawLocalBackend = serde_yaml::from_value(rest).map_err(decode_err)?;
                Ok(Self::Local {
                    workspace_root: raw.workspace_root,
                    dry_run: raw.dry_run,
                })
            }
            "slurm" => {
                let raw: RawSlurmBackend = serde_yaml::from_value(rest).map_err(decode_err)?;
                Ok(Self::Slurm {
                    workspace_root: raw.workspace_root,
                    ssh: raw.ssh,
                    slurm: raw.slurm,
                })
            }
            "profile" => {
                let raw: RawProfileBackend = serde_yaml::from_value(rest).map_err(decode_err)?;
                Ok(Self::Profile { name: raw.name })
            }
            "legacy" => {
                let raw: RawLegacyBackend = serde_yaml::from_value(rest).map_err(decode_err)?;
                Ok(Self::Legacy { path: raw.path })
            }
            other => Err(invalid(format!("{at}: unknown backend.type {other:?}"))),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOperatorInstance {
    kind: OperatorKind,
    #[serde(default)]
    backend: Option<Value>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    operator_name: Option<String>,
    #[serde(default)]
    max_concurrent: Option<u32>,
}

/// Validated config for one operator instance.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorInstanceConfig {
    pub kind: OperatorKind,
    /// Present only for compute kinds; defaults to a local backend.
    pub backend: Option<BackendConfig>,
    pub slug: Option<String>,
    pub operator_name: Option<String>,
    /// Per-operator concurrency cap; None inherits the global limit.
    pub max_concurrent: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub max_concurrent_global: Option<u32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOperatorsFile {
    #[serde(default)]
    defaults: Option<DefaultsConfig>,
    operators: BTreeMap<String, Value>,
}

/// Parsed and validated operators.yaml content.
#[derive(Clone, Debug, Default)]
pub struct OperatorsConfig {
    pub operators: BTreeMap<String, OperatorInstanceConfig>,
    pub defaults: DefaultsConfig,
}

impl OperatorsConfig {
    pub fn load(path: &Path) -> Result<Self, WiringConfigError> {
        if !path.is_file() {
            return Err(WiringConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| WiringConfigError::Parse {
            path: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::parse(&raw, &path.display().to_string())
    }

    pub fn parse(content: &str, path: &str) -> Result<Self, WiringConfigError> {
        let raw: RawOperatorsFile =
            serde_yaml::from_str(content).map_err(|e| WiringConfigError::Parse {
                path: path.to_string(),
                detail: e.to_string(),
            })?;
        let invalid = |detail: String| WiringConfigError::Invalid {
            path: path.to_string(),
            detail,
        };

        if let Some(defaults) = &raw.defaults {
            if defaults.max_concurrent_global == Some(0) {
                return Err(invalid(
                    "defaults.max_concurrent_global must be a positive integer".to_string(),
                ));
            }
        }

        let mut operators = BTreeMap::new();
        for (raw_key, raw_value) in raw.operators {
            if raw_key != raw_key.trim() || raw_key.to_lowercase() != raw_key {
                return Err(invalid(format!(
                    "operator key must be lowercase canonical form: {raw_key:?}"
                )));
            }
            let key = normalize_operator_key(&raw_key)
                .map_err(|e| invalid(format!("invalid operator key {raw_key:?}: {e}")))?;
            let (key_kind, _) = split_operator_key(&key)
                .map_err(|e| invalid(format!("invalid operator key {raw_key:?}: {e}")))?;

            let at = format!("operators.{key}");
            let raw_inst: RawOperatorInstance = serde_yaml::from_value(raw_value)
                .map_err(|e| invalid(format!("{at}: {e}")))?;

            if raw_inst.kind.as_str() != key_kind {
                return Err(invalid(format!(
                    "{at}: key kind {key_kind:?} does not match config kind {:?}",
                    raw_inst.kind.as_str()
                )));
            }
            if raw_inst.max_concurrent == Some(0) {
                return Err(invalid(format!(
                    "{at}: max_concurrent must be a positive integer or omitted"
                )));
            }

            let backend = match (raw_inst.kind.is_compute(), raw_inst.backend) {
                (true, Some(value)) => {
                    let backend = BackendConfig::from_yaml(value, &at, path)?;
                    if matches!(backend, BackendConfig::Legacy { .. })
                        && raw_inst.kind != OperatorKind::Hpc
                    {
                        return Err(invalid(format!(
                            "{at}: backend.type='legacy' is only valid for kind='hpc'"
                        )));
                    }
                    Some(backend)
                }
                (true, None) => Some(BackendConfig::Local {
                    workspace_root: None,
                    dry_run: false,
                }),
                (false, Some(_)) => {
                    return Err(invalid(format!(
                        "{at}: kind {:?} must not define 'backend'",
                        raw_inst.kind.as_str()
                    )))
                }
                (false, None) => None,
            };

            operators.insert(
                key,
                OperatorInstanceConfig {
                    kind: raw_inst.kind,
                    backend,
                    slug: raw_inst.slug,
                    operator_name: raw_inst.operator_name,
                    max_concurrent: raw_inst.max_concurrent,
                },
            );
        }

        Ok(Self {
            operators,
            defaults: raw.defaults.unwrap_or_default(),
        })
    }
}
