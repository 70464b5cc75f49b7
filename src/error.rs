use thiserror::Error;

use crate::composition::CompositionError;
use crate::lifecycle::{JobHandle, JobStatus, LifecycleError};
use crate::measurement::MeasurementError;
use crate::registration::RegistrationError;
use crate::transfer::PlanError;
use crate::workcell::WorkcellError;

#[derive(Debug, Error)]
pub enum WetloopError {
    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Workcell(#[from] WorkcellError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Measurement(#[from] MeasurementError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("job {handle} ended {status} instead of completing")]
    JobNotCompleted { handle: JobHandle, status: JobStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WetloopError {
    /// True for a lifecycle wait that ran out of time.
    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, WetloopError::Lifecycle(LifecycleError::Timeout { .. }))
    }
}
