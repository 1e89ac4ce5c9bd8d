//! The operator lifecycle contract.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use matterstack_core::{AttemptStatus, OperatorError, RunHandle, Task};

/// Dispatch context for one attempt: identifiers plus the attempt-scoped
/// namespaces allocated by the engine. Evidence and remote workdirs are never
/// reused across attempts of the same task.
#[derive(Clone, Debug)]
pub struct AttemptRef {
    pub run_id: String,
    pub task_id: String,
    pub attempt_id: String,
    pub attempt_index: u32,
    pub operator_key: String,
    /// Absolute evidence directory under the run root.
    pub evidence_dir: PathBuf,
    /// Evidence directory relative to the run root.
    pub evidence_rel: String,
    /// Attempt-scoped remote working directory, for remote backends.
    pub workdir_remote: Option<String>,
}

/// Mutable view of an attempt as seen by its operator.
///
/// The engine constructs handles from persisted attempt rows, passes them
/// through the lifecycle operations, and persists whatever comes back.
#[derive(Clone, Debug)]
pub struct OperatorHandle {
    pub task_id: String,
    pub attempt_id: String,
    pub operator_key: String,
    pub status: AttemptStatus,
    pub external_id: Option<String>,
    pub operator_data: Map<String, Value>,
    pub evidence_dir: PathBuf,
    pub workdir_remote: Option<String>,
    pub reason: Option<String>,
}

impl OperatorHandle {
    pub fn new(attempt: &AttemptRef) -> Self {
        Self {
            task_id: attempt.task_id.clone(),
            attempt_id: attempt.attempt_id.clone(),
            operator_key: attempt.operator_key.clone(),
            status: AttemptStatus::Created,
            external_id: None,
            operator_data: Map::new(),
            evidence_dir: attempt.evidence_dir.clone(),
            workdir_remote: attempt.workdir_remote.clone(),
            reason: None,
        }
    }

    pub fn with_status(mut self, status: AttemptStatus) -> Self {
        self.status = status;
        self
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.operator_data.get(key).and_then(Value::as_str)
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        self.operator_data.insert(key.to_string(), value);
    }

    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.status = AttemptStatus::Failed;
        self.reason = Some(reason.clone());
        self.set_data("error", Value::String(reason));
        self
    }
}

/// Artifacts and structured data collected from a finished attempt.
#[derive(Clone, Debug, Default)]
pub struct OperatorOutcome {
    /// Artifact name (relative to the evidence dir) -> local path.
    pub files: BTreeMap<String, PathBuf>,
    pub data: Option<Value>,
}

/// Uniform lifecycle contract for external execution systems.
///
/// Constraints shared by all implementations:
/// - `prepare` materializes the attempt workspace inside the run root and
///   returns a handle in CREATED; it must not write outside the run root.
/// - `submit` is idempotent: a handle that already carries an external id is
///   returned unchanged.
/// - `check` is a pure function of backend state with no side effects on the
///   run root.
/// - `collect` is called once per attempt, on the transition to COMPLETED;
///   missing artifacts fail the attempt.
pub trait Operator: Send + Sync {
    fn kind(&self) -> &'static str;

    fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt: &AttemptRef,
    ) -> Result<OperatorHandle, OperatorError>;

    fn submit(&self, handle: OperatorHandle) -> Result<OperatorHandle, OperatorError>;

    fn check(&self, handle: &OperatorHandle) -> Result<OperatorHandle, OperatorError>;

    fn collect(&self, handle: &OperatorHandle) -> Result<OperatorOutcome, OperatorError>;

    /// Best-effort cancellation of in-flight external work.
    fn cancel(&self, handle: &OperatorHandle) -> Result<(), OperatorError> {
        let _ = handle;
        Ok(())
    }

    /// Human-actionable description of what unblocks a waiting attempt.
    fn waiting_hint(&self, handle: &OperatorHandle) -> String {
        format!(
            "external operator active at {}",
            handle.evidence_dir.display()
        )
    }
}

/// Collect every regular file under `dir`, excluding the given names,
/// keyed by path relative to `dir`.
pub(crate) fn collect_directory_files(
    dir: &Path,
    exclude: &[&str],
) -> BTreeMap<String, PathBuf> {
    let mut out = BTreeMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if exclude.contains(&name.as_str()) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(dir) {
                    out.insert(rel.to_string_lossy().to_string(), path.clone());
                }
            }
        }
    }
    out
}
