//! Error taxonomy shared across the workspace.
//!
//! Three tiers: [`OperatorError`] at the operator/backend boundary,
//! [`EngineError`] for everything the orchestrator surfaces to callers, and
//! [`CoreError`] for domain-level validation. The engine maps boundary
//! errors into attempt/run state; only process-fatal kinds escape a tick.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Errors raised at the operator/backend boundary.
///
/// The poller and dispatcher translate these into attempt state: transients
/// are retried next tick, everything else fails the attempt with a reason.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Network or scheduler glitch; the attempt keeps its status and is
    /// retried next tick.
    #[error("transient backend error: {0}")]
    Transient(String),
    /// Definitive failure observed by the operator (terminal external state,
    /// missing outputs at collect time).
    #[error("attempt failed: {0}")]
    AttemptFailed(String),
    /// A write escaped the run root.
    #[error("path safety violation: {0}")]
    PathSafety(String),
    /// Malformed request/response manifest.
    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),
    /// Submission failed in a way that will not succeed on retry.
    #[error("submission failed: {0}")]
    SubmitFailed(String),
}

impl OperatorError {
    /// True when the next tick should retry without touching the attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors surfaced by the state store, wiring resolver, and engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Another process holds the run lock; caller retries later.
    #[error("run lock is held{}", holder_suffix(.holder))]
    LockHeld { holder: Option<String> },

    /// The database carries a schema version newer than this build knows.
    /// Fatal for the process; no state is mutated.
    #[error("unsupported schema version {found} (supported up to {supported})")]
    SchemaVersion { found: i64, supported: i64 },

    /// Attempted to change persisted wiring on an existing run without force.
    #[error("refusing to override persisted operator wiring: {0}")]
    WiringOverride(String),

    /// Dispatch or polling could not resolve an operator key in the registry.
    #[error("unknown operator key: {0}")]
    UnknownOperatorKey(String),

    /// plan/analyze raised; the run is failed with this reason.
    #[error("campaign error: {0}")]
    Campaign(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("wiring error: {0}")]
    Wiring(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("attempt {0} not found")]
    AttemptNotFound(String),

    /// Terminal attempts are immutable apart from reason appends.
    #[error("attempt {0} is terminal and cannot be modified")]
    TerminalAttempt(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(String),
}

fn holder_suffix(holder: &Option<String>) -> String {
    match holder {
        Some(h) => format!(" by {h}"),
        None => String::new(),
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        EngineError::Invalid(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_reports_holder() {
        let err = EngineError::LockHeld {
            holder: Some("pid 4242".to_string()),
        };
        assert_eq!(err.to_string(), "run lock is held by pid 4242");

        let anon = EngineError::LockHeld { holder: None };
        assert_eq!(anon.to_string(), "run lock is held");
    }

    #[test]
    fn transient_classification() {
        assert!(OperatorError::Transient("ssh timeout".into()).is_transient());
        assert!(!OperatorError::AttemptFailed("exit 1".into()).is_transient());
    }
}
