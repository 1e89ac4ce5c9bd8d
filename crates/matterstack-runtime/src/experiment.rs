//! Laboratory experiment operator.
//!
//! The protocol mirrors the human operator with instrument-oriented file
//! names: the orchestrator writes `experiment_request.json` and the lab
//! control software answers with `experiment_result.json`.

use serde_json::json;
use tracing::info;

use matterstack_core::{AttemptStatus, OperatorError, RunHandle, Task};

use crate::backend::stage_task_files;
use crate::fs_safety::ensure_under_run_root;
use crate::manifest::{write_task_manifest, ExchangeRequest, ExchangeResponse, ExchangeStatus};
use crate::operator::{
    collect_directory_files, AttemptRef, Operator, OperatorHandle, OperatorOutcome,
};

const REQUEST_FILE: &str = "experiment_request.json";
const RESULT_FILE: &str = "experiment_result.json";
const SYSTEM_FILES: &[&str] = &["manifest.json", REQUEST_FILE, RESULT_FILE];

#[derive(Default)]
pub struct ExperimentOperator;

impl ExperimentOperator {
    pub fn new() -> Self {
        Self
    }
}

impl Operator for ExperimentOperator {
    fn kind(&self) -> &'static str {
        "experiment"
    }

    fn prepare(
        &self,
        run: &RunHandle,
        task: &Task,
        attempt: &AttemptRef,
    ) -> Result<OperatorHandle, OperatorError> {
        let dir = ensure_under_run_root(&run.root_path, &attempt.evidence_dir)?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| OperatorError::PathSafety(format!("create {}: {e}", dir.display())))?;

        write_task_manifest(&dir.join("manifest.json"), task)?;

        let request = ExchangeRequest {
            procedure: task.command.clone(),
            parameters: json!(task.env),
        };
        let raw = serde_json::to_string_pretty(&request)
            .map_err(|e| OperatorError::ManifestValidation(format!("encode request: {e}")))?;
        std::fs::write(dir.join(REQUEST_FILE), raw + "\n")
            .map_err(|e| OperatorError::PathSafety(format!("write {REQUEST_FILE}: {e}")))?;

        // Input files ride along for the instrument side.
        stage_task_files(task, &dir)?;

        info!(task_id = %task.task_id, dir = %attempt.evidence_rel, "prepared experiment attempt");
        Ok(OperatorHandle::new(attempt))
    }

    fn submit(&self, handle: OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        if handle.status != AttemptStatus::Created {
            return Ok(handle);
        }
        Ok(handle.with_status(AttemptStatus::WaitingExternal))
    }

    fn check(&self, handle: &OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        let mut updated = handle.clone();
        if updated.status.is_terminal() {
            return Ok(updated);
        }
        let result_path = updated.evidence_dir.join(RESULT_FILE);
        if !result_path.is_file() {
            return Ok(updated);
        }
        match ExchangeResponse::read(&result_path) {
            Ok(result) => match result.status {
                ExchangeStatus::Success => updated.status = AttemptStatus::Completed,
                ExchangeStatus::Failed => {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "instrument reported failure".to_string());
                    updated = updated.fail(reason);
                }
            },
            Err(OperatorError::ManifestValidation(detail)) => {
                updated = updated.fail(detail);
            }
            Err(other) => return Err(other),
        }
        Ok(updated)
    }

    fn collect(&self, handle: &OperatorHandle) -> Result<OperatorOutcome, OperatorError> {
        let result = ExchangeResponse::read(&handle.evidence_dir.join(RESULT_FILE))?;
        Ok(OperatorOutcome {
            files: collect_directory_files(&handle.evidence_dir, SYSTEM_FILES),
            data: result.data,
        })
    }

    fn waiting_hint(&self, handle: &OperatorHandle) -> String {
        format!(
            "waiting for {RESULT_FILE} at {}",
            handle.evidence_dir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_result_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("lab", "r1", dir.path());
        let task = Task::new("anneal_profile_2")
            .with_id("anneal_1")
            .with_env("temperature_c", "450");
        let attempt = AttemptRef {
            run_id: run.run_id.clone(),
            task_id: "anneal_1".to_string(),
            attempt_id: "a1".to_string(),
            attempt_index: 1,
            operator_key: "experiment.default".to_string(),
            evidence_dir: run.attempt_dir("anneal_1", "a1"),
            evidence_rel: "tasks/anneal_1/attempts/a1".to_string(),
            workdir_remote: None,
        };

        let op = ExperimentOperator::new();
        let waiting = op.submit(op.prepare(&run, &task, &attempt).unwrap()).unwrap();
        assert_eq!(waiting.status, AttemptStatus::WaitingExternal);

        let request: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(attempt.evidence_dir.join(REQUEST_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(request["procedure"], "anneal_profile_2");
        assert_eq!(request["parameters"]["temperature_c"], "450");

        std::fs::write(
            attempt.evidence_dir.join(RESULT_FILE),
            r#"{"status": "success", "data": {"thickness_nm": 112}}"#,
        )
        .unwrap();
        std::fs::write(attempt.evidence_dir.join("trace.csv"), "t,thickness\n").unwrap();

        let done = op.check(&waiting).unwrap();
        assert_eq!(done.status, AttemptStatus::Completed);

        let outcome = op.collect(&done).unwrap();
        assert_eq!(outcome.data.unwrap()["thickness_nm"], 112);
        assert!(outcome.files.contains_key("trace.csv"));
        assert!(!outcome.files.contains_key(REQUEST_FILE));
    }

    #[test]
    fn malformed_result_fails_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("lab", "r1", dir.path());
        let task = Task::new("measure").with_id("m1");
        let attempt = AttemptRef {
            run_id: run.run_id.clone(),
            task_id: "m1".to_string(),
            attempt_id: "a1".to_string(),
            attempt_index: 1,
            operator_key: "experiment.default".to_string(),
            evidence_dir: run.attempt_dir("m1", "a1"),
            evidence_rel: "tasks/m1/attempts/a1".to_string(),
            workdir_remote: None,
        };
        let op = ExperimentOperator::new();
        let waiting = op.submit(op.prepare(&run, &task, &attempt).unwrap()).unwrap();

        std::fs::write(attempt.evidence_dir.join(RESULT_FILE), "not json at all").unwrap();
        let failed = op.check(&waiting).unwrap();
        assert_eq!(failed.status, AttemptStatus::Failed);
    }
}
