use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::Job;

/// Lifecycle status of a job on the workcell.
///
/// Each job flows through: SUBMITTED → AWAITING_APPROVAL → RUNNING → one of
/// COMPLETED, FAILED, CANCELLED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    AwaitingApproval,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Maps the workcell's status vocabulary onto the local states.
    ///
    /// Returns `None` for a word the workcell has never been seen to use.
    pub fn from_remote(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let status = match normalized.as_str() {
            "submitted" | "created" | "queued" => JobStatus::Submitted,
            "pending" | "pending_approval" | "awaiting_approval" => JobStatus::AwaitingApproval,
            "running" | "in_progress" => JobStatus::Running,
            "completed" | "succeeded" => JobStatus::Completed,
            "failed" | "error" => JobStatus::Failed,
            "cancelled" | "canceled" => JobStatus::Cancelled,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "SUBMITTED"),
            JobStatus::AwaitingApproval => write!(f, "AWAITING_APPROVAL"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// What a single status observation did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same status as the previous poll.
    Unchanged,
    /// A new non-terminal status.
    Changed(JobStatus),
    /// A terminal status; polling stops.
    Terminal(JobStatus),
}

/// Applies remote status observations to a `Job`.
pub struct StateMachine;

impl StateMachine {
    /// Records `status` as observed at `elapsed_ms` into the job.
    ///
    /// Only the first observation of each distinct status is recorded, so
    /// a job polled as [submitted, submitted, completed] carries two entries.
    pub fn observe(job: &mut Job, status: JobStatus, elapsed_ms: u64) -> Transition {
        if job.last_observed == Some(status) {
            return Transition::Unchanged;
        }

        job.last_observed = Some(status);
        job.status = status;
        job.history.push(super::job::StatusChange { status, elapsed_ms });

        if status.is_terminal() {
            Transition::Terminal(status)
        } else {
            Transition::Changed(status)
        }
    }
}
