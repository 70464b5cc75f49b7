mod controller;
mod job;
mod state;

pub use controller::{
    CANCEL_CHECK_TOOL, CANCEL_TOOL, LifecycleController, LifecycleError, PollPolicy, STATUS_TOOL,
    SUBMIT_TOOL,
};
pub use job::{Job, JobHandle, JobOutcome, StatusChange};
pub use state::{JobStatus, StateMachine, Transition};
