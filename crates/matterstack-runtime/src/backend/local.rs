//! Local subprocess backend.
//!
//! Each attempt runs `submit.sh` in its own evidence directory through a
//! wrapper that redirects stdout/stderr to log files and writes the exit
//! status to an `exit_code` file. The pid is recorded in a `pid` file, so a
//! restarted orchestrator can re-derive job state from the filesystem alone:
//! exit_code present -> terminal; pid alive -> running; neither -> lost.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use tracing::{debug, info};

use matterstack_core::workflow::DownloadPatterns;
use matterstack_core::{JobState, JobStatus, OperatorError, Task};

use super::{ComputeBackend, JobContext, SubmitContext};

pub struct LocalBackend {
    dry_run: bool,
    // Children owned by this process, reaped on poll.
    children: Mutex<HashMap<String, Child>>,
}

impl LocalBackend {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn read_exit_code(dir: &Path) -> Option<i32> {
        let raw = std::fs::read_to_string(dir.join("exit_code")).ok()?;
        raw.trim().parse().ok()
    }

    fn pid_alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    fn job_pid(job_id: &str) -> Option<u32> {
        job_id.strip_prefix("local-")?.parse().ok()
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ComputeBackend for LocalBackend {
    fn is_local_execution(&self) -> bool {
        true
    }

    fn render_submit_script(&self, task: &Task) -> String {
        let mut script = String::from("#!/bin/sh\n");
        for (key, value) in &task.env {
            script.push_str(&format!("export {key}={}\n", shell_quote(value)));
        }
        script.push_str(&task.command);
        script.push('\n');
        script
    }

    fn submit(&self, ctx: &SubmitContext<'_>) -> Result<String, OperatorError> {
        if self.dry_run {
            info!(dir = %ctx.local_dir.display(), "dry-run submit");
            std::fs::write(ctx.local_dir.join("exit_code"), "0\n")
                .map_err(|e| OperatorError::SubmitFailed(format!("dry-run marker: {e}")))?;
            return Ok("local-dry-run".to_string());
        }

        // A pid file means a prior submission already spawned this attempt
        // (possibly in a process that died before persisting the id): adopt
        // it instead of spawning a duplicate.
        if let Ok(raw) = std::fs::read_to_string(ctx.local_dir.join("pid")) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                debug!(pid, "adopting previously spawned local job");
                return Ok(format!("local-{pid}"));
            }
        }

        // The wrapper writes the exit status even when the command fails, so
        // restarts can recover terminal state from the filesystem.
        let child = Command::new("sh")
            .arg("-c")
            .arg("sh submit.sh > stdout.log 2> stderr.log; echo $? > exit_code")
            .current_dir(ctx.local_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| OperatorError::SubmitFailed(format!("spawn submit wrapper: {e}")))?;

        let pid = child.id();
        let job_id = format!("local-{pid}");
        std::fs::write(ctx.local_dir.join("pid"), format!("{pid}\n"))
            .map_err(|e| OperatorError::SubmitFailed(format!("write pid file: {e}")))?;
        self.children
            .lock()
            .map_err(|_| OperatorError::SubmitFailed("child table poisoned".into()))?
            .insert(job_id.clone(), child);

        debug!(job_id = %job_id, dir = %ctx.local_dir.display(), "local job started");
        Ok(job_id)
    }

    fn poll(&self, job_id: &str, ctx: &JobContext<'_>) -> Result<JobStatus, OperatorError> {
        // Reap an owned child if it has finished; terminal state still comes
        // from the exit_code file.
        if let Ok(mut children) = self.children.lock() {
            let finished = children
                .get_mut(job_id)
                .map(|child| matches!(child.try_wait(), Ok(Some(_))))
                .unwrap_or(false);
            if finished {
                children.remove(job_id);
            }
        }

        if let Some(code) = Self::read_exit_code(ctx.local_dir) {
            let state = if code == 0 {
                JobState::CompletedOk
            } else {
                JobState::CompletedError
            };
            let mut status = JobStatus::new(job_id, state);
            status.exit_code = Some(code);
            if code != 0 {
                status.reason = Some(format!("exit code {code}"));
            }
            return Ok(status);
        }

        match Self::job_pid(job_id) {
            Some(pid) if Self::pid_alive(pid) => Ok(JobStatus::new(job_id, JobState::Running)),
            Some(_) => Ok(JobStatus::new(job_id, JobState::Lost).with_reason("Job Lost")),
            None => Ok(JobStatus::new(job_id, JobState::Lost).with_reason("Job Lost")),
        }
    }

    fn download(
        &self,
        _job_id: &str,
        _ctx: &JobContext<'_>,
        _patterns: Option<&DownloadPatterns>,
    ) -> Result<(), OperatorError> {
        // Outputs are produced directly in the attempt directory.
        Ok(())
    }

    fn cancel(&self, job_id: &str, _ctx: &JobContext<'_>) -> Result<(), OperatorError> {
        if let Ok(mut children) = self.children.lock() {
            if let Some(mut child) = children.remove(job_id) {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(());
            }
        }
        if let Some(pid) = Self::job_pid(job_id) {
            let _ = Command::new("kill").arg(pid.to_string()).status();
        }
        Ok(())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn wait_for_exit(backend: &LocalBackend, job_id: &str, dir: &Path) -> JobStatus {
        let ctx = JobContext {
            local_dir: dir,
            workdir_remote: None,
        };
        for _ in 0..100 {
            let status = backend.poll(job_id, &ctx).unwrap();
            if !matches!(status.state, JobState::Running | JobState::Queued) {
                return status;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("job {job_id} did not finish");
    }

    fn submit_command(backend: &LocalBackend, dir: &Path, command: &str) -> String {
        let task = Task::new(command).with_id("t");
        std::fs::write(dir.join("submit.sh"), backend.render_submit_script(&task)).unwrap();
        let env = BTreeMap::new();
        let ctx = SubmitContext {
            local_dir: dir,
            workdir_remote: None,
            env: &env,
        };
        backend.submit(&ctx).unwrap()
    }

    #[test]
    fn successful_command_completes_with_logs() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let job_id = submit_command(&backend, dir.path(), "echo hello");

        let status = wait_for_exit(&backend, &job_id, dir.path());
        assert_eq!(status.state, JobState::CompletedOk);
        assert_eq!(status.exit_code, Some(0));
        let stdout = std::fs::read_to_string(dir.path().join("stdout.log")).unwrap();
        assert_eq!(stdout.trim(), "hello");
        assert!(dir.path().join("pid").is_file());
    }

    #[test]
    fn failing_command_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let job_id = submit_command(&backend, dir.path(), "exit 3");

        let status = wait_for_exit(&backend, &job_id, dir.path());
        assert_eq!(status.state, JobState::CompletedError);
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(status.reason.as_deref(), Some("exit code 3"));
    }

    #[test]
    fn unknown_pid_without_exit_code_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let ctx = JobContext {
            local_dir: dir.path(),
            workdir_remote: None,
        };
        // A pid that cannot exist on Linux (beyond pid_max).
        let status = backend.poll("local-4999999", &ctx).unwrap();
        assert_eq!(status.state, JobState::Lost);
        assert_eq!(status.reason.as_deref(), Some("Job Lost"));
    }

    #[test]
    fn dry_run_completes_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(true);
        let env = BTreeMap::new();
        let ctx = SubmitContext {
            local_dir: dir.path(),
            workdir_remote: None,
            env: &env,
        };
        let job_id = backend.submit(&ctx).unwrap();
        let status = backend
            .poll(
                &job_id,
                &JobContext {
                    local_dir: dir.path(),
                    workdir_remote: None,
                },
            )
            .unwrap();
        assert_eq!(status.state, JobState::CompletedOk);
        assert!(!dir.path().join("stdout.log").exists());
    }

    #[test]
    fn env_is_exported_into_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::default();
        let task = Task::new("echo $GREETING").with_id("t").with_env("GREETING", "hi there");
        std::fs::write(dir.path().join("submit.sh"), backend.render_submit_script(&task)).unwrap();
        let env = BTreeMap::new();
        let ctx = SubmitContext {
            local_dir: dir.path(),
            workdir_remote: None,
            env: &env,
        };
        let job_id = backend.submit(&ctx).unwrap();
        let status = wait_for_exit(&backend, &job_id, dir.path());
        assert_eq!(status.state, JobState::CompletedOk);
        let stdout = std::fs::read_to_string(dir.path().join("stdout.log")).unwrap();
        assert_eq!(stdout.trim(), "hi there");
    }
}
