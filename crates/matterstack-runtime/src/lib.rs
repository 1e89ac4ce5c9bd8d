//! Operator implementations and compute backends.
//!
//! Every external execution system is reached through the same four-step
//! lifecycle contract ([`Operator`]): prepare an attempt-scoped workspace,
//! submit, check, collect. Compute operators drive a [`backend::ComputeBackend`]
//! (local subprocesses or Slurm over SSH); human and experiment operators
//! exchange files with an external party.

pub mod backend;
mod compute;
mod config_snapshot;
mod experiment;
mod fs_safety;
mod human;
mod manifest;
mod operator;
mod registry;

pub use compute::ComputeOperator;
pub use config_snapshot::{write_attempt_config_snapshot, ConfigSnapshot};
pub use experiment::ExperimentOperator;
pub use fs_safety::ensure_under_run_root;
pub use human::HumanOperator;
pub use manifest::{
    write_task_manifest, ExchangeRequest, ExchangeResponse, ExchangeStatus,
};
pub use operator::{AttemptRef, Operator, OperatorHandle, OperatorOutcome};
pub use registry::{
    builtin_factories, BuiltOperator, OperatorFactory, OperatorRegistry, RegistryError,
    RegistryOptions,
};
