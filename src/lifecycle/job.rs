use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::JobStatus;

/// Opaque job identifier assigned by the workcell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One distinct status seen while waiting on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub elapsed_ms: u64,
}

/// Local view of a job while the controller owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub handle: JobHandle,
    pub status: JobStatus,
    /// Last status reported by a poll; `None` until the first poll lands.
    pub last_observed: Option<JobStatus>,
    pub history: Vec<StatusChange>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(handle: JobHandle) -> Self {
        Self {
            handle,
            status: JobStatus::Submitted,
            last_observed: None,
            history: Vec::new(),
            submitted_at: Utc::now(),
        }
    }
}

/// Structured record produced once a job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub handle: JobHandle,
    pub status: JobStatus,
    /// The full status payload of the final poll.
    pub payload: Value,
    pub history: Vec<StatusChange>,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl JobOutcome {
    pub fn from_job(job: Job, payload: Value, elapsed_ms: u64) -> Self {
        Self {
            handle: job.handle,
            status: job.status,
            payload,
            history: job.history,
            submitted_at: job.submitted_at,
            completed_at: Utc::now(),
            elapsed_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
