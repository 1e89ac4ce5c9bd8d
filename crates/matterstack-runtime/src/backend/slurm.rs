//! Slurm backend over an SSH transport.
//!
//! The transport is a trait so site plumbing stays swappable; the backend
//! only composes commands (`sbatch`, `squeue`, `sacct`, `scancel`) and
//! parses Slurm state words into the common [`JobState`] model.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

use matterstack_core::workflow::DownloadPatterns;
use matterstack_core::{JobState, JobStatus, OperatorError, Task};
use matterstack_wiring::SshConfig;

use super::{patterns_allow, ComputeBackend, JobContext, SubmitContext};

/// Captured output of one remote command.
#[derive(Clone, Debug)]
pub struct TransportOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TransportOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

/// Remote shell and file transfer contract used by the Slurm backend.
pub trait SshTransport: Send + Sync {
    fn run(&self, command: &str) -> Result<TransportOutput, OperatorError>;
    fn upload(&self, local: &Path, remote: &str) -> Result<(), OperatorError>;
    fn download(&self, remote: &str, local: &Path) -> Result<(), OperatorError>;
}

/// Transport shelling out to the system `ssh`/`scp` binaries.
pub struct SshCliTransport {
    config: SshConfig,
}

impl SshCliTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(key) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }

    fn scp_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-P".to_string(),
            self.config.port.to_string(),
            "-r".to_string(),
        ];
        if let Some(key) = &self.config.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }
}

impl SshTransport for SshCliTransport {
    fn run(&self, command: &str) -> Result<TransportOutput, OperatorError> {
        let output = Command::new("ssh")
            .args(self.ssh_args())
            .arg(self.destination())
            .arg(command)
            .output()
            .map_err(|e| OperatorError::Transient(format!("ssh spawn failed: {e}")))?;
        Ok(TransportOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), OperatorError> {
        let status = Command::new("scp")
            .args(self.scp_args())
            .arg(local)
            .arg(format!("{}:{remote}", self.destination()))
            .status()
            .map_err(|e| OperatorError::Transient(format!("scp spawn failed: {e}")))?;
        if !status.success() {
            return Err(OperatorError::Transient(format!(
                "scp upload to {remote} exited with {status}"
            )));
        }
        Ok(())
    }

    fn download(&self, remote: &str, local: &Path) -> Result<(), OperatorError> {
        let status = Command::new("scp")
            .args(self.scp_args())
            .arg(format!("{}:{remote}", self.destination()))
            .arg(local)
            .status()
            .map_err(|e| OperatorError::Transient(format!("scp spawn failed: {e}")))?;
        if !status.success() {
            return Err(OperatorError::Transient(format!(
                "scp download of {remote} exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Map a Slurm state word to the common job-state model.
pub fn map_slurm_state(word: &str) -> JobState {
    let word = word.trim().trim_end_matches('+').to_uppercase();
    if word.starts_with("CANCELLED") {
        return JobState::Cancelled;
    }
    match word.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => JobState::Queued,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::CompletedOk,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "PREEMPTED" | "OUT_OF_MEMORY" | "BOOT_FAIL"
        | "DEADLINE" => JobState::CompletedError,
        "" => JobState::Lost,
        _ => JobState::Unknown,
    }
}

fn walltime(minutes: u32) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

pub struct SlurmBackend {
    transport: Box<dyn SshTransport>,
    slurm_options: BTreeMap<String, String>,
}

impl SlurmBackend {
    pub fn new(
        transport: Box<dyn SshTransport>,
        slurm_options: BTreeMap<String, String>,
    ) -> Self {
        Self {
            transport,
            slurm_options,
        }
    }

    fn require_workdir<'a>(&self, ctx_workdir: Option<&'a str>) -> Result<&'a str, OperatorError> {
        ctx_workdir.ok_or_else(|| {
            OperatorError::SubmitFailed("slurm backend requires a remote workdir".to_string())
        })
    }
}

impl ComputeBackend for SlurmBackend {
    fn is_local_execution(&self) -> bool {
        false
    }

    fn render_submit_script(&self, task: &Task) -> String {
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name={}\n", task.task_id));
        script.push_str(&format!("#SBATCH --cpus-per-task={}\n", task.cores));
        script.push_str(&format!("#SBATCH --mem={}G\n", task.memory_gb));
        script.push_str(&format!(
            "#SBATCH --time={}\n",
            walltime(task.time_limit_minutes)
        ));
        if task.gpus > 0 {
            script.push_str(&format!("#SBATCH --gres=gpu:{}\n", task.gpus));
        }
        for (key, value) in &self.slurm_options {
            script.push_str(&format!("#SBATCH --{key}={value}\n"));
        }
        script.push('\n');
        for (key, value) in &task.env {
            script.push_str(&format!("export {key}='{}'\n", value.replace('\'', "'\\''")));
        }
        script.push_str(&task.command);
        script.push_str("\nrc=$?\necho $rc > exit_code\nexit $rc\n");
        script
    }

    fn submit(&self, ctx: &SubmitContext<'_>) -> Result<String, OperatorError> {
        let workdir = self.require_workdir(ctx.workdir_remote)?;

        // The job-id marker survives an orchestrator crash between sbatch
        // and the durable attempt write; adopt it rather than resubmitting.
        let marker = ctx.local_dir.join("slurm_job_id");
        if let Ok(existing) = std::fs::read_to_string(&marker) {
            let existing = existing.trim();
            if !existing.is_empty() {
                debug!(job_id = %existing, "adopting previously submitted slurm job");
                return Ok(existing.to_string());
            }
        }

        let mkdir = self.transport.run(&format!("mkdir -p '{workdir}'"))?;
        if !mkdir.ok() {
            return Err(OperatorError::Transient(format!(
                "mkdir {workdir} failed: {}",
                mkdir.stderr.trim()
            )));
        }

        // Stage the attempt directory contents into the remote workdir.
        self.transport
            .upload(ctx.local_dir, &format!("{workdir}/"))?;

        let sbatch = self.transport.run(&format!(
            "cd '{workdir}' && sbatch --parsable --chdir='{workdir}' submit.sh"
        ))?;
        if !sbatch.ok() {
            return Err(OperatorError::SubmitFailed(format!(
                "sbatch failed: {}",
                sbatch.stderr.trim()
            )));
        }
        let job_id = sbatch
            .stdout
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        if job_id.is_empty() {
            return Err(OperatorError::SubmitFailed(
                "sbatch returned no job id".to_string(),
            ));
        }
        if let Err(e) = std::fs::write(&marker, format!("{job_id}\n")) {
            warn!(job_id = %job_id, error = %e, "could not write slurm job-id marker");
        }
        debug!(job_id = %job_id, workdir = %workdir, "slurm job submitted");
        Ok(job_id)
    }

    fn poll(&self, job_id: &str, _ctx: &JobContext<'_>) -> Result<JobStatus, OperatorError> {
        let squeue = self
            .transport
            .run(&format!("squeue -h -j {job_id} -o %T"))?;
        let word = squeue.stdout.trim();
        if squeue.ok() && !word.is_empty() {
            let state = map_slurm_state(word);
            let mut status = JobStatus::new(job_id, state);
            if state == JobState::CompletedError {
                status.reason = Some(word.to_string());
            }
            return Ok(status);
        }

        // Not in the queue anymore; ask accounting for the terminal state.
        let sacct = self
            .transport
            .run(&format!("sacct -n -X -j {job_id} -o State"))?;
        if !sacct.ok() {
            return Err(OperatorError::Transient(format!(
                "sacct failed for job {job_id}: {}",
                sacct.stderr.trim()
            )));
        }
        let word = sacct.stdout.lines().next().unwrap_or("").trim().to_string();
        let state = map_slurm_state(&word);
        let mut status = JobStatus::new(job_id, state);
        match state {
            JobState::CompletedError => status.reason = Some(word),
            JobState::Lost => status.reason = Some("Job Lost".to_string()),
            JobState::Unknown => {
                warn!(job_id = %job_id, state = %word, "unrecognized slurm state");
            }
            _ => {}
        }
        Ok(status)
    }

    fn download(
        &self,
        job_id: &str,
        ctx: &JobContext<'_>,
        patterns: Option<&DownloadPatterns>,
    ) -> Result<(), OperatorError> {
        let workdir = self.require_workdir(ctx.workdir_remote)?;
        let outputs = ctx.local_dir.join("outputs");
        std::fs::create_dir_all(&outputs)
            .map_err(|e| OperatorError::AttemptFailed(format!("create outputs dir: {e}")))?;

        self.transport.download(&format!("{workdir}/."), &outputs)?;

        // Apply selective-download patterns after transfer, keeping the
        // exit_code artifact unconditionally.
        if patterns.is_some() {
            let files = crate::operator::collect_directory_files(&outputs, &[]);
            for (rel, path) in files {
                if rel != "exit_code" && !patterns_allow(patterns, &rel) {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
        debug!(job_id = %job_id, "slurm outputs ingested");
        Ok(())
    }

    fn cancel(&self, job_id: &str, _ctx: &JobContext<'_>) -> Result<(), OperatorError> {
        let out = self.transport.run(&format!("scancel {job_id}"))?;
        if !out.ok() {
            return Err(OperatorError::Transient(format!(
                "scancel {job_id} failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport returning scripted responses per command prefix.
    struct FakeTransport {
        responses: Mutex<Vec<(&'static str, TransportOutput)>>,
        commands: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<(&'static str, TransportOutput)>) -> Self {
            Self {
                responses: Mutex::new(responses),
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    fn out(status: i32, stdout: &str) -> TransportOutput {
        TransportOutput {
            status,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    impl SshTransport for FakeTransport {
        fn run(&self, command: &str) -> Result<TransportOutput, OperatorError> {
            self.commands.lock().unwrap().push(command.to_string());
            let responses = self.responses.lock().unwrap();
            for (prefix, output) in responses.iter() {
                if command.contains(prefix) {
                    return Ok(output.clone());
                }
            }
            Ok(out(0, ""))
        }

        fn upload(&self, _local: &Path, _remote: &str) -> Result<(), OperatorError> {
            Ok(())
        }

        fn download(&self, _remote: &str, _local: &Path) -> Result<(), OperatorError> {
            Ok(())
        }
    }

    #[test]
    fn state_words_map_into_the_decision_model() {
        assert_eq!(map_slurm_state("PENDING"), JobState::Queued);
        assert_eq!(map_slurm_state("RUNNING"), JobState::Running);
        assert_eq!(map_slurm_state("COMPLETING"), JobState::Running);
        assert_eq!(map_slurm_state("COMPLETED"), JobState::CompletedOk);
        for failure in ["FAILED", "TIMEOUT", "NODE_FAIL", "PREEMPTED", "OUT_OF_MEMORY"] {
            assert_eq!(map_slurm_state(failure), JobState::CompletedError);
        }
        assert_eq!(map_slurm_state("CANCELLED by 104"), JobState::Cancelled);
        assert_eq!(map_slurm_state(""), JobState::Lost);
        assert_eq!(map_slurm_state("SPECIAL_EXIT"), JobState::Unknown);
    }

    #[test]
    fn submit_parses_parsable_job_id() {
        let transport = FakeTransport::new(vec![("sbatch", out(0, "12345;cluster\n"))]);
        let backend = SlurmBackend::new(Box::new(transport), BTreeMap::new());
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        let ctx = SubmitContext {
            local_dir: dir.path(),
            workdir_remote: Some("/scratch/ms/ws/r1/t1/a1"),
            env: &env,
        };
        assert_eq!(backend.submit(&ctx).unwrap(), "12345");
    }

    #[test]
    fn poll_falls_back_to_sacct_for_finished_jobs() {
        let transport = FakeTransport::new(vec![
            ("squeue", out(0, "")),
            ("sacct", out(0, "TIMEOUT+\n")),
        ]);
        let backend = SlurmBackend::new(Box::new(transport), BTreeMap::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = JobContext {
            local_dir: dir.path(),
            workdir_remote: Some("/scratch/x"),
        };
        let status = backend.poll("99", &ctx).unwrap();
        assert_eq!(status.state, JobState::CompletedError);
        assert_eq!(status.reason.as_deref(), Some("TIMEOUT"));
    }

    #[test]
    fn vanished_job_is_lost() {
        let transport =
            FakeTransport::new(vec![("squeue", out(0, "")), ("sacct", out(0, "\n"))]);
        let backend = SlurmBackend::new(Box::new(transport), BTreeMap::new());
        let dir = tempfile::tempdir().unwrap();
        let ctx = JobContext {
            local_dir: dir.path(),
            workdir_remote: None,
        };
        let status = backend.poll("77", &ctx).unwrap();
        assert_eq!(status.state, JobState::Lost);
        assert_eq!(status.reason.as_deref(), Some("Job Lost"));
    }

    #[test]
    fn submit_script_carries_resources_and_site_options() {
        let mut options = BTreeMap::new();
        options.insert("partition".to_string(), "batch".to_string());
        let backend = SlurmBackend::new(
            Box::new(FakeTransport::new(vec![])),
            options,
        );
        let mut task = Task::new("srun ./sim").with_id("sim_01");
        task.cores = 8;
        task.memory_gb = 32;
        task.gpus = 2;
        task.time_limit_minutes = 90;

        let script = backend.render_submit_script(&task);
        assert!(script.contains("#SBATCH --cpus-per-task=8"));
        assert!(script.contains("#SBATCH --mem=32G"));
        assert!(script.contains("#SBATCH --time=01:30:00"));
        assert!(script.contains("#SBATCH --gres=gpu:2"));
        assert!(script.contains("#SBATCH --partition=batch"));
        assert!(script.contains("echo $rc > exit_code"));
    }
}
