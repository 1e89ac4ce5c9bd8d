//! Operator wiring: the canonical operators.yaml schema and the per-run
//! resolution/snapshot discipline that makes resumes deterministic.

mod config;
mod resolver;

pub use config::{
    BackendConfig, DefaultsConfig, OperatorInstanceConfig, OperatorKind, OperatorsConfig,
    SshConfig, WiringConfigError,
};
pub use resolver::{
    resolve_operator_wiring, ResolvedWiring, WiringError, WiringRequest, WiringSource,
    ENV_OPERATORS_CONFIG,
};
