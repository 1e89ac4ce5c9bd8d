//! Compute backend contract.
//!
//! A backend executes one staged attempt directory: the submit script and
//! file inputs are already materialized by the operator before `submit` is
//! called. Backends are the only layer that knows about transports; the
//! operator above sees job ids and [`JobStatus`] values.

mod local;
mod slurm;

pub use local::LocalBackend;
pub use slurm::{SlurmBackend, SshCliTransport, SshTransport, TransportOutput};

use std::collections::BTreeMap;
use std::path::Path;

use matterstack_core::workflow::DownloadPatterns;
use matterstack_core::{JobStatus, OperatorError, Task};

/// Attempt-side inputs to a submission.
pub struct SubmitContext<'a> {
    /// Staged attempt directory on the local filesystem.
    pub local_dir: &'a Path,
    /// Attempt-scoped remote working directory (remote backends only).
    pub workdir_remote: Option<&'a str>,
    pub env: &'a BTreeMap<String, String>,
}

/// Attempt-side inputs to poll/download/cancel.
pub struct JobContext<'a> {
    pub local_dir: &'a Path,
    pub workdir_remote: Option<&'a str>,
}

pub trait ComputeBackend: Send + Sync {
    /// True when the backend executes on this machine; local backends run
    /// directly inside the attempt evidence directory and skip downloads.
    fn is_local_execution(&self) -> bool;

    /// Render the submit script content for a task (shebang included).
    fn render_submit_script(&self, task: &Task) -> String;

    /// Transmit the staged attempt and return the backend job id.
    fn submit(&self, ctx: &SubmitContext<'_>) -> Result<String, OperatorError>;

    /// Query the backend for current job state. No run-root side effects.
    fn poll(&self, job_id: &str, ctx: &JobContext<'_>) -> Result<JobStatus, OperatorError>;

    /// Retrieve job outputs into the local attempt directory.
    fn download(
        &self,
        job_id: &str,
        ctx: &JobContext<'_>,
        patterns: Option<&DownloadPatterns>,
    ) -> Result<(), OperatorError>;

    fn cancel(&self, job_id: &str, ctx: &JobContext<'_>) -> Result<(), OperatorError>;
}

/// Stage a task's file inputs into the attempt directory.
pub fn stage_task_files(task: &Task, dir: &Path) -> Result<(), OperatorError> {
    use matterstack_core::workflow::FileInput;
    for (dest, input) in &task.files {
        let dest_path = dir.join(dest);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OperatorError::PathSafety(format!("create {}: {e}", parent.display()))
            })?;
        }
        match input {
            FileInput::Inline(content) => {
                std::fs::write(&dest_path, content).map_err(|e| {
                    OperatorError::PathSafety(format!("write {}: {e}", dest_path.display()))
                })?;
            }
            FileInput::LocalPath(source) => {
                std::fs::copy(source, &dest_path).map_err(|e| {
                    OperatorError::SubmitFailed(format!(
                        "copy input {source} -> {}: {e}",
                        dest_path.display()
                    ))
                })?;
            }
        }
    }
    Ok(())
}

/// Minimal glob matching for download patterns: `*` matches any run of
/// characters (including `/`), `?` matches one.
pub(crate) fn glob_matches(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &v[1..]),
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

/// Apply include/exclude patterns to a relative artifact path.
pub(crate) fn patterns_allow(patterns: Option<&DownloadPatterns>, rel_path: &str) -> bool {
    let Some(patterns) = patterns else {
        return true;
    };
    if !patterns.include.is_empty()
        && !patterns.include.iter().any(|p| glob_matches(p, rel_path))
    {
        return false;
    }
    !patterns.exclude.iter().any(|p| glob_matches(p, rel_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_basics() {
        assert!(glob_matches("*.json", "results.json"));
        assert!(glob_matches("results/*", "results/out.csv"));
        assert!(glob_matches("exit_?ode", "exit_code"));
        assert!(!glob_matches("*.json", "results.csv"));
    }

    #[test]
    fn patterns_filter_includes_and_excludes() {
        let patterns = DownloadPatterns {
            include: vec!["*.log".into(), "results/*".into()],
            exclude: vec!["*.tmp".into()],
        };
        assert!(patterns_allow(Some(&patterns), "stdout.log"));
        assert!(patterns_allow(Some(&patterns), "results/final.csv"));
        assert!(!patterns_allow(Some(&patterns), "scratch.dat"));

        let exclude_only = DownloadPatterns {
            include: vec![],
            exclude: vec!["*.tmp".into()],
        };
        assert!(!patterns_allow(Some(&exclude_only), "work.tmp"));
        assert!(patterns_allow(Some(&exclude_only), "work.dat"));
        assert!(patterns_allow(None, "anything"));
    }
}
