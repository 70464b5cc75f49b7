use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::job::{Job, JobHandle, JobOutcome};
use super::state::{JobStatus, StateMachine, Transition};
use crate::workcell::{ToolInvoker, WorkcellError};

pub const SUBMIT_TOOL: &str = "instantiate_workflow";
pub const STATUS_TOOL: &str = "get_workflow_instance_details";
pub const CANCEL_CHECK_TOOL: &str = "check_workflow_instance_cancellable";
pub const CANCEL_TOOL: &str = "cancel_workflow_instance";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("workcell did not accept the job: {reason}; payload: {payload}")]
    SubmissionRejected { reason: String, payload: String },

    #[error("job {handle} still {} after {elapsed:?}", describe_status(.last_status))]
    Timeout {
        handle: JobHandle,
        last_status: Option<JobStatus>,
        elapsed: Duration,
    },

    #[error("lost contact with the workcell while waiting on job {handle} ({failures} polls failed in a row)")]
    ConnectionLost {
        handle: JobHandle,
        failures: u32,
        #[source]
        last_error: WorkcellError,
    },

    #[error("refusing to cancel job {handle} without explicit confirmation")]
    CancellationNotConfirmed { handle: JobHandle },

    #[error("workcell reports job {handle} cannot be cancelled safely; payload: {payload}")]
    CancellationUnsafe { handle: JobHandle, payload: String },

    #[error(transparent)]
    Workcell(#[from] WorkcellError),
}

/// Cadence and limits for [`LifecycleController::await_terminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Consecutive transport failures tolerated before giving up.
    pub max_consecutive_failures: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_wait: Duration::from_secs(180 * 60),
            max_consecutive_failures: 5,
        }
    }
}

/// Drives one job at a time through submit, wait and cancel.
pub struct LifecycleController<'a, C: ToolInvoker> {
    client: &'a C,
    call_timeout: Duration,
}

impl<'a, C: ToolInvoker> LifecycleController<'a, C> {
    pub fn new(client: &'a C, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    /// Instantiates `definition_id` on the workcell. Never retried.
    ///
    /// `target` is the plate barcode; it is merged into `inputs` as
    /// `plate_barcode`.
    pub async fn submit(
        &self,
        definition_id: i64,
        target: &str,
        inputs: Value,
        reason: &str,
    ) -> Result<JobHandle, LifecycleError> {
        let mut inputs = match inputs {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(LifecycleError::SubmissionRejected {
                    reason: "job inputs must be a JSON object".into(),
                    payload: other.to_string(),
                });
            }
        };
        inputs.insert("plate_barcode".into(), Value::String(target.to_string()));

        let arguments = json!({
            "definition_id": definition_id,
            "inputs": inputs,
            "reason": reason,
        });

        let reply = match self
            .client
            .invoke(SUBMIT_TOOL, arguments, self.call_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(WorkcellError::Remote {
                message, payload, ..
            }) => {
                return Err(LifecycleError::SubmissionRejected {
                    reason: message,
                    payload,
                });
            }
            // A client-side HTTP error is a refusal, not a lost connection.
            Err(WorkcellError::Status { status, body, .. })
                if !WorkcellError::is_transient_status(status) =>
            {
                return Err(LifecycleError::SubmissionRejected {
                    reason: format!("HTTP {status}"),
                    payload: body,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let handle = extract_handle(&reply).ok_or_else(|| LifecycleError::SubmissionRejected {
            reason: "reply carried no job handle".into(),
            payload: reply.to_string(),
        })?;
        info!(job = %handle, definition_id, plate = target, "job submitted");
        Ok(handle)
    }

    /// Polls the job until it reaches a terminal status or `max_wait` runs out.
    ///
    /// `on_transition` fires once per distinct status, with the time elapsed
    /// since polling began.
    pub async fn await_terminal<F>(
        &self,
        handle: &JobHandle,
        policy: &PollPolicy,
        mut on_transition: F,
    ) -> Result<JobOutcome, LifecycleError>
    where
        F: FnMut(JobStatus, Duration),
    {
        let started = Instant::now();
        let mut job = Job::new(handle.clone());
        let mut failures = 0u32;

        loop {
            let elapsed = started.elapsed();
            match self.poll_status(handle).await {
                Ok((status, payload)) => {
                    failures = 0;
                    let elapsed_ms = elapsed.as_millis() as u64;
                    match StateMachine::observe(&mut job, status, elapsed_ms) {
                        Transition::Unchanged => {}
                        Transition::Changed(status) => {
                            debug!(job = %handle, %status, "job status changed");
                            on_transition(status, elapsed);
                        }
                        Transition::Terminal(status) => {
                            info!(job = %handle, %status, elapsed_ms, "job reached terminal status");
                            on_transition(status, elapsed);
                            return Ok(JobOutcome::from_job(job, payload, elapsed_ms));
                        }
                    }
                }
                Err(LifecycleError::Workcell(err)) if err.is_transport() => {
                    failures += 1;
                    warn!(
                        job = %handle,
                        failures,
                        max = policy.max_consecutive_failures,
                        error = %err,
                        "status poll failed"
                    );
                    if failures >= policy.max_consecutive_failures {
                        return Err(LifecycleError::ConnectionLost {
                            handle: handle.clone(),
                            failures,
                            last_error: err,
                        });
                    }
                }
                Err(e) => return Err(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= policy.max_wait {
                warn!(job = %handle, ?elapsed, "gave up waiting on job");
                return Err(LifecycleError::Timeout {
                    handle: handle.clone(),
                    last_status: job.last_observed,
                    elapsed,
                });
            }
            sleep(policy.poll_interval.min(policy.max_wait - elapsed)).await;
        }
    }

    /// Reads the current status once.
    pub async fn status(&self, handle: &JobHandle) -> Result<(JobStatus, Value), LifecycleError> {
        self.poll_status(handle).await
    }

    async fn poll_status(&self, handle: &JobHandle) -> Result<(JobStatus, Value), LifecycleError> {
        let payload = self
            .client
            .invoke_read(
                STATUS_TOOL,
                json!({"instance_uuid": handle.as_str()}),
                self.call_timeout,
            )
            .await?;

        let raw = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WorkcellError::protocol(STATUS_TOOL, "status reply has no status field", payload.to_string())
            })?;
        let status = JobStatus::from_remote(raw).ok_or_else(|| {
            WorkcellError::protocol(
                STATUS_TOOL,
                format!("unknown job status '{raw}'"),
                payload.to_string(),
            )
        })?;
        Ok((status, payload))
    }

    /// Cancels a job on the workcell.
    ///
    /// The remote cancel-safety check always runs first. Without `confirmed`
    /// nothing is cancelled, whatever the check said.
    pub async fn cancel(&self, handle: &JobHandle, confirmed: bool) -> Result<(), LifecycleError> {
        let check = self
            .client
            .invoke_read(
                CANCEL_CHECK_TOOL,
                json!({"instance_uuid": handle.as_str()}),
                self.call_timeout,
            )
            .await;

        if !confirmed {
            match &check {
                Ok(reply) => info!(job = %handle, reply = %reply, "cancel check done, awaiting confirmation"),
                Err(e) => warn!(job = %handle, error = %e, "cancel check failed"),
            }
            return Err(LifecycleError::CancellationNotConfirmed {
                handle: handle.clone(),
            });
        }

        let reply = check?;
        let safe = cancellable(&reply).ok_or_else(|| {
            WorkcellError::protocol(
                CANCEL_CHECK_TOOL,
                "cancel check reply has no cancellable flag",
                reply.to_string(),
            )
        })?;
        if !safe {
            return Err(LifecycleError::CancellationUnsafe {
                handle: handle.clone(),
                payload: reply.to_string(),
            });
        }

        self.client
            .invoke(
                CANCEL_TOOL,
                json!({"instance_uuid": handle.as_str()}),
                self.call_timeout,
            )
            .await?;
        info!(job = %handle, "job cancelled");
        Ok(())
    }
}

fn describe_status(status: &Option<JobStatus>) -> String {
    status.map_or_else(|| "unobserved".to_string(), |s| s.to_string())
}

fn extract_handle(reply: &Value) -> Option<JobHandle> {
    let raw = match reply {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => ["uuid", "instance_uuid", "id"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str)),
        _ => None,
    }?;
    let raw = raw.trim();
    (!raw.is_empty()).then(|| JobHandle::from(raw))
}

fn cancellable(reply: &Value) -> Option<bool> {
    match reply {
        Value::Bool(b) => Some(*b),
        Value::Object(map) => ["cancellable", "can_cancel", "is_cancellable"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_bool)),
        _ => None,
    }
}
