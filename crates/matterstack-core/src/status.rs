//! Status enums for runs, tasks, attempts, and external jobs.
//!
//! The orchestrator derives everything from three layers of state: the run,
//! the logical task, and the attempt. External backends report a fourth,
//! `JobState`, which is folded into attempt status through a single decision
//! table ([`JobState::decision`]) so that every terminal transition is
//! enumerated in one place.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "CANCELLED" => Some(Self::Cancelled),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Logical status of a task within a workflow.
///
/// PENDING tasks become READY when their dependencies are satisfied; the
/// dispatcher only submits READY tasks. The remaining states mirror the
/// current attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Submitted,
    Running,
    WaitingExternal,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::WaitingExternal => "WAITING_EXTERNAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "READY" => Some(Self::Ready),
            "SUBMITTED" => Some(Self::Submitted),
            "RUNNING" => Some(Self::Running),
            "WAITING_EXTERNAL" => Some(Self::WaitingExternal),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Status of a single execution attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Created,
    Submitted,
    Running,
    WaitingExternal,
    Completed,
    Failed,
    FailedInit,
    Cancelled,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedInit | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::WaitingExternal => "WAITING_EXTERNAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedInit => "FAILED_INIT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(Self::Created),
            "SUBMITTED" => Some(Self::Submitted),
            "RUNNING" => Some(Self::Running),
            "WAITING_EXTERNAL" => Some(Self::WaitingExternal),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "FAILED_INIT" => Some(Self::FailedInit),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Logical task status implied by this attempt status.
    pub fn task_status(self) -> TaskStatus {
        match self {
            Self::Created => TaskStatus::Pending,
            Self::Submitted | Self::WaitingExternal => TaskStatus::WaitingExternal,
            Self::Running => TaskStatus::Running,
            Self::Completed => TaskStatus::Completed,
            Self::Failed | Self::FailedInit => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// State of a job as reported by an external backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    CompletedOk,
    CompletedError,
    Cancelled,
    Lost,
    Unknown,
}

/// Backend status report for a single job.
#[derive(Clone, Debug)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

impl JobStatus {
    pub fn new(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            exit_code: None,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// What the poller must do with an external state.
///
/// Exactly one state triggers result collection; every state not listed in
/// the table is treated as a retryable transient and leaves the attempt
/// untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalDecision {
    /// Update the attempt to the given in-flight status.
    InFlight(AttemptStatus),
    /// Collect results, then mark COMPLETED (or FAILED on missing outputs).
    Collect,
    /// Mark the attempt terminal with the given status.
    Terminal(AttemptStatus),
    /// Transient or unknown; keep the attempt as-is and retry next tick.
    Retry,
}

impl JobState {
    /// The single decision table mapping external state to poller action.
    pub fn decision(self) -> ExternalDecision {
        match self {
            Self::Queued => ExternalDecision::InFlight(AttemptStatus::Submitted),
            Self::Running => ExternalDecision::InFlight(AttemptStatus::Running),
            Self::CompletedOk => ExternalDecision::Collect,
            Self::CompletedError => ExternalDecision::Terminal(AttemptStatus::Failed),
            Self::Cancelled => ExternalDecision::Terminal(AttemptStatus::Cancelled),
            Self::Lost => ExternalDecision::Terminal(AttemptStatus::Failed),
            Self::Unknown => ExternalDecision::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            AttemptStatus::Created,
            AttemptStatus::Submitted,
            AttemptStatus::Running,
            AttemptStatus::WaitingExternal,
            AttemptStatus::Completed,
            AttemptStatus::Failed,
            AttemptStatus::FailedInit,
            AttemptStatus::Cancelled,
        ] {
            assert_eq!(AttemptStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(AttemptStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_sets_are_consistent() {
        assert!(AttemptStatus::FailedInit.is_terminal());
        assert!(!AttemptStatus::WaitingExternal.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Paused.is_active());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
    }

    #[test]
    fn decision_table_collects_only_on_completed_ok() {
        let collects: Vec<JobState> = [
            JobState::Queued,
            JobState::Running,
            JobState::CompletedOk,
            JobState::CompletedError,
            JobState::Cancelled,
            JobState::Lost,
            JobState::Unknown,
        ]
        .into_iter()
        .filter(|s| s.decision() == ExternalDecision::Collect)
        .collect();
        assert_eq!(collects, vec![JobState::CompletedOk]);
    }

    #[test]
    fn lost_jobs_fail() {
        assert_eq!(
            JobState::Lost.decision(),
            ExternalDecision::Terminal(AttemptStatus::Failed)
        );
        assert_eq!(JobState::Unknown.decision(), ExternalDecision::Retry);
    }

    #[test]
    fn attempt_status_maps_to_task_status() {
        assert_eq!(
            AttemptStatus::Submitted.task_status(),
            TaskStatus::WaitingExternal
        );
        assert_eq!(AttemptStatus::FailedInit.task_status(), TaskStatus::Failed);
        assert_eq!(AttemptStatus::Created.task_status(), TaskStatus::Pending);
    }
}
