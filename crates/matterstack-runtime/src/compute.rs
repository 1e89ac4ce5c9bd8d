//! Compute operator: drives a [`ComputeBackend`] through the lifecycle
//! contract.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use matterstack_core::{
    AttemptStatus, ExternalDecision, OperatorError, RunHandle, Task,
};

use crate::backend::{stage_task_files, ComputeBackend, JobContext, SubmitContext};
use crate::config_snapshot::write_attempt_config_snapshot;
use crate::fs_safety::ensure_under_run_root;
use crate::manifest::write_task_manifest;
use crate::operator::{
    collect_directory_files, AttemptRef, Operator, OperatorHandle, OperatorOutcome,
};

/// Files written by the orchestrator itself, excluded from collected
/// artifacts for locally-executed attempts.
const SYSTEM_FILES: &[&str] = &["submit.sh", "manifest.json", "pid"];

pub struct ComputeOperator {
    backend: Arc<dyn ComputeBackend>,
    kind: &'static str,
}

impl ComputeOperator {
    pub fn new(backend: Arc<dyn ComputeBackend>, kind: &'static str) -> Self {
        Self { backend, kind }
    }

    fn task_from_handle(handle: &OperatorHandle) -> Result<Task, OperatorError> {
        let value = handle.operator_data.get("task").ok_or_else(|| {
            OperatorError::SubmitFailed("operator_data is missing the task payload".to_string())
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| OperatorError::SubmitFailed(format!("decode task payload: {e}")))
    }
}

impl Operator for ComputeOperator {
    fn kind(&self) -> &'static str {
        self.kind
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
        std::fs::write(dir.join("submit.sh"), self.backend.render_submit_script(task))
            .map_err(|e| OperatorError::PathSafety(format!("write submit.sh: {e}")))?;
        stage_task_files(task, &dir)?;

        let snapshot = write_attempt_config_snapshot(&run.root_path, &dir)?;

        let mut handle = OperatorHandle::new(attempt);
        handle.set_data(
            "task",
            serde_json::to_value(task)
                .map_err(|e| OperatorError::ManifestValidation(format!("encode task: {e}")))?,
        );
        handle.set_data("config_hash", Value::String(snapshot.config_hash));
        handle.set_data("config_snapshot", snapshot.config_files);

        info!(
            task_id = %task.task_id,
            attempt_id = %attempt.attempt_id,
            dir = %attempt.evidence_rel,
            "prepared compute attempt"
        );
        Ok(handle)
    }

    fn submit(&self, handle: OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        if handle.external_id.is_some() {
            return Ok(handle);
        }
        let task = Self::task_from_handle(&handle)?;
        let ctx = SubmitContext {
            local_dir: &handle.evidence_dir,
            workdir_remote: handle.workdir_remote.as_deref(),
            env: &task.env,
        };
        let job_id = self.backend.submit(&ctx)?;
        info!(task_id = %handle.task_id, job_id = %job_id, "submitted compute attempt");

        let mut handle = handle;
        handle.external_id = Some(job_id);
        handle.status = AttemptStatus::Submitted;
        Ok(handle)
    }

    fn check(&self, handle: &OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        let mut updated = handle.clone();
        if updated.status.is_terminal() {
            return Ok(updated);
        }
        let Some(job_id) = updated.external_id.clone() else {
            return Ok(updated);
        };

        let ctx = JobContext {
            local_dir: &updated.evidence_dir,
            workdir_remote: updated.workdir_remote.as_deref(),
        };
        let status = self.backend.poll(&job_id, &ctx)?;

        match status.state.decision() {
            ExternalDecision::InFlight(next) => {
                // Never downgrade an attempt already observed running.
                if !(updated.status == AttemptStatus::Running
                    && next == AttemptStatus::Submitted)
                {
                    updated.status = next;
                }
            }
            ExternalDecision::Collect => {
                updated.status = AttemptStatus::Completed;
            }
            ExternalDecision::Terminal(next) => {
                updated.status = next;
                updated.reason = status.reason.clone();
                if let Some(reason) = &status.reason {
                    updated.set_data("error", Value::String(reason.clone()));
                }
            }
            ExternalDecision::Retry => {
                debug!(job_id = %job_id, "backend state unknown; will retry");
            }
        }
        if let Some(code) = status.exit_code {
            updated.set_data("exit_code", Value::from(code));
        }
        Ok(updated)
    }

    fn collect(&self, handle: &OperatorHandle) -> Result<OperatorOutcome, OperatorError> {
        let job_id = handle.external_id.clone().ok_or_else(|| {
            OperatorError::AttemptFailed("collect called before submission".to_string())
        })?;
        let task = Self::task_from_handle(handle)?;
        let ctx = JobContext {
            local_dir: &handle.evidence_dir,
            workdir_remote: handle.workdir_remote.as_deref(),
        };
        self.backend
            .download(&job_id, &ctx, task.download_patterns.as_ref())?;

        let artifact_root = if self.backend.is_local_execution() {
            handle.evidence_dir.clone()
        } else {
            handle.evidence_dir.join("outputs")
        };
        let files = collect_directory_files(&artifact_root, SYSTEM_FILES);

        // The exit_code artifact is the minimal proof of completion.
        if !artifact_root.join("exit_code").is_file() {
            return Err(OperatorError::AttemptFailed(format!(
                "missing exit_code artifact under {}",
                artifact_root.display()
            )));
        }

        let exit_code = handle.operator_data.get("exit_code").cloned();
        Ok(OperatorOutcome {
            files,
            data: Some(serde_json::json!({
                "job_id": job_id,
                "exit_code": exit_code,
            })),
        })
    }

    fn cancel(&self, handle: &OperatorHandle) -> Result<(), OperatorError> {
        if let Some(job_id) = &handle.external_id {
            let ctx = JobContext {
                local_dir: &handle.evidence_dir,
                workdir_remote: handle.workdir_remote.as_deref(),
            };
            self.backend.cancel(job_id, &ctx)?;
        }
        Ok(())
    }

    fn waiting_hint(&self, handle: &OperatorHandle) -> String {
        match &handle.external_id {
            Some(job_id) => format!("job {job_id} in flight on the {} backend", self.kind),
            None => "attempt prepared but not yet submitted".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use std::time::Duration;

    fn attempt_ref(run: &RunHandle, task_id: &str, attempt_id: &str) -> AttemptRef {
        AttemptRef {
            run_id: run.run_id.clone(),
            task_id: task_id.to_string(),
            attempt_id: attempt_id.to_string(),
            attempt_index: 1,
            operator_key: "local.default".to_string(),
            evidence_dir: run.attempt_dir(task_id, attempt_id),
            evidence_rel: format!("tasks/{task_id}/attempts/{attempt_id}"),
            workdir_remote: None,
        }
    }

    fn check_until_terminal(op: &ComputeOperator, handle: &OperatorHandle) -> OperatorHandle {
        for _ in 0..100 {
            let updated = op.check(handle).unwrap();
            if updated.status.is_terminal() {
                return updated;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("attempt never reached a terminal status");
    }

    #[test]
    fn full_lifecycle_on_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("ws", "r1", dir.path());
        let op = ComputeOperator::new(Arc::new(LocalBackend::default()), "local");
        let task = Task::new("echo done > result.txt").with_id("t1");
        let attempt = attempt_ref(&run, "t1", "a1");

        let prepared = op.prepare(&run, &task, &attempt).unwrap();
        assert_eq!(prepared.status, AttemptStatus::Created);
        assert!(attempt.evidence_dir.join("manifest.json").is_file());
        assert!(attempt.evidence_dir.join("submit.sh").is_file());
        assert!(prepared.operator_data.contains_key("config_hash"));

        let submitted = op.submit(prepared).unwrap();
        assert_eq!(submitted.status, AttemptStatus::Submitted);
        let job_id = submitted.external_id.clone().unwrap();

        // Submit is idempotent once an external id exists.
        let resubmitted = op.submit(submitted.clone()).unwrap();
        assert_eq!(resubmitted.external_id.as_deref(), Some(job_id.as_str()));

        let terminal = check_until_terminal(&op, &submitted);
        assert_eq!(terminal.status, AttemptStatus::Completed);

        let outcome = op.collect(&terminal).unwrap();
        assert!(outcome.files.contains_key("result.txt"));
        assert!(outcome.files.contains_key("exit_code"));
        assert!(!outcome.files.contains_key("submit.sh"));
    }

    #[test]
    fn failing_task_carries_reason() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("ws", "r1", dir.path());
        let op = ComputeOperator::new(Arc::new(LocalBackend::default()), "local");
        let task = Task::new("exit 7").with_id("t1");
        let attempt = attempt_ref(&run, "t1", "a1");

        let prepared = op.prepare(&run, &task, &attempt).unwrap();
        let submitted = op.submit(prepared).unwrap();
        let terminal = check_until_terminal(&op, &submitted);
        assert_eq!(terminal.status, AttemptStatus::Failed);
        assert_eq!(terminal.reason.as_deref(), Some("exit code 7"));
    }

    #[test]
    fn prepare_rejects_evidence_outside_run_root() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunHandle::new("ws", "r1", dir.path().join("run"));
        let op = ComputeOperator::new(Arc::new(LocalBackend::default()), "local");
        let task = Task::new("true").with_id("t1");
        let mut attempt = attempt_ref(&run, "t1", "a1");
        attempt.evidence_dir = dir.path().join("elsewhere");

        let err = op.prepare(&run, &task, &attempt).unwrap_err();
        assert!(matches!(err, OperatorError::PathSafety(_)));
    }
}
