//! Human-in-the-loop operator.
//!
//! Prepares a directory holding `instructions.md` and `schema.json`, then
//! waits for a reviewer to drop a `response.json` following the exchange
//! protocol. Nothing is executed; the filesystem is the interface.

use serde_json::json;
use tracing::info;

use matterstack_core::{AttemptStatus, OperatorError, RunHandle, Task};

use crate::fs_safety::ensure_under_run_root;
use crate::manifest::{write_task_manifest, ExchangeResponse, ExchangeStatus};
use crate::operator::{
    collect_directory_files, AttemptRef, Operator, OperatorHandle, OperatorOutcome,
};

const RESPONSE_FILE: &str = "response.json";
const SYSTEM_FILES: &[&str] = &["manifest.json", "instructions.md", "schema.json", RESPONSE_FILE];

#[derive(Default)]
pub struct HumanOperator;

impl HumanOperator {
    pub fn new() -> Self {
        Self
    }

    fn instructions_for(task: &Task) -> String {
        let body = task
            .env
            .get("INSTRUCTIONS")
            .cloned()
            .unwrap_or_else(|| "Please complete the task as described.".to_string());
        format!(
            "# Human task: {id}\n\n{body}\n\n## Completion\n\nCreate a file named \
             `{RESPONSE_FILE}` in this directory:\n\n```json\n{{\"status\": \"success\", \
             \"data\": {{}}}}\n```\n\nor, to reject:\n\n```json\n{{\"status\": \"failed\", \
             \"reason\": \"...\"}}\n```\n",
            id = task.task_id,
        )
    }
}

impl Operator for HumanOperator {
    fn kind(&self) -> &'static str {
        "human"
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
        std::fs::write(dir.join("instructions.md"), Self::instructions_for(task))
            .map_err(|e| OperatorError::PathSafety(format!("write instructions.md: {e}")))?;

        let schema = json!({
            "type": "object",
            "required": ["status"],
            "properties": {
                "status": {"type": "string", "enum": ["success", "failed"]},
                "data": {"type": "object"},
                "reason": {"type": "string"},
            },
        });
        std::fs::write(
            dir.join("schema.json"),
            serde_json::to_string_pretty(&schema).unwrap_or_default() + "\n",
        )
        .map_err(|e| OperatorError::PathSafety(format!("write schema.json: {e}")))?;

        info!(task_id = %task.task_id, dir = %attempt.evidence_rel, "prepared human attempt");
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
        let response_path = updated.evidence_dir.join(RESPONSE_FILE);
        if !response_path.is_file() {
            return Ok(updated);
        }
        match ExchangeResponse::read(&response_path) {
            Ok(response) => match response.status {
                ExchangeStatus::Success => {
                    updated.status = AttemptStatus::Completed;
                }
                ExchangeStatus::Failed => {
                    let reason = response
                        .reason
                        .unwrap_or_else(|| "external party reported failure".to_string());
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
        let response_path = handle.evidence_dir.join(RESPONSE_FILE);
        let response = ExchangeResponse::read(&response_path)?;
        Ok(OperatorOutcome {
            files: collect_directory_files(&handle.evidence_dir, SYSTEM_FILES),
            data: response.data,
        })
    }

    fn waiting_hint(&self, handle: &OperatorHandle) -> String {
        format!(
            "create {RESPONSE_FILE} at {}; see instructions.md",
            handle.evidence_dir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, RunHandle, Task, AttemptRef) {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("ws", "r1", dir.path());
        let task = Task::new("").with_id("review_1").with_env(
            "INSTRUCTIONS",
            "Inspect the XRD pattern and confirm phase purity.",
        );
        let attempt = AttemptRef {
            run_id: run.run_id.clone(),
            task_id: "review_1".to_string(),
            attempt_id: "a1".to_string(),
            attempt_index: 1,
            operator_key: "human.default".to_string(),
            evidence_dir: run.attempt_dir("review_1", "a1"),
            evidence_rel: "tasks/review_1/attempts/a1".to_string(),
            workdir_remote: None,
        };
        (dir, run, task, attempt)
    }

    #[test]
    fn waits_until_response_appears() {
        let (_dir, run, task, attempt) = setup();
        let op = HumanOperator::new();

        let prepared = op.prepare(&run, &task, &attempt).unwrap();
        assert!(attempt.evidence_dir.join("instructions.md").is_file());
        assert!(attempt.evidence_dir.join("schema.json").is_file());

        let waiting = op.submit(prepared).unwrap();
        assert_eq!(waiting.status, AttemptStatus::WaitingExternal);

        // No response yet: status unchanged.
        let still_waiting = op.check(&waiting).unwrap();
        assert_eq!(still_waiting.status, AttemptStatus::WaitingExternal);

        std::fs::write(
            attempt.evidence_dir.join(RESPONSE_FILE),
            r#"{"status": "success", "data": {"phase_pure": true}}"#,
        )
        .unwrap();
        let done = op.check(&waiting).unwrap();
        assert_eq!(done.status, AttemptStatus::Completed);

        let outcome = op.collect(&done).unwrap();
        assert_eq!(outcome.data.unwrap()["phase_pure"], true);
    }

    #[test]
    fn failed_response_fails_with_reason() {
        let (_dir, run, task, attempt) = setup();
        let op = HumanOperator::new();
        let waiting = op.submit(op.prepare(&run, &task, &attempt).unwrap()).unwrap();

        std::fs::write(
            attempt.evidence_dir.join(RESPONSE_FILE),
            r#"{"status": "failed", "reason": "sample degraded"}"#,
        )
        .unwrap();
        let failed = op.check(&waiting).unwrap();
        assert_eq!(failed.status, AttemptStatus::Failed);
        assert_eq!(failed.reason.as_deref(), Some("sample degraded"));
    }

    #[test]
    fn malformed_response_fails_the_attempt() {
        let (_dir, run, task, attempt) = setup();
        let op = HumanOperator::new();
        let waiting = op.submit(op.prepare(&run, &task, &attempt).unwrap()).unwrap();

        std::fs::write(attempt.evidence_dir.join(RESPONSE_FILE), "{oops").unwrap();
        let failed = op.check(&waiting).unwrap();
        assert_eq!(failed.status, AttemptStatus::Failed);
        assert!(failed.reason.unwrap().contains("invalid response"));
    }
}
