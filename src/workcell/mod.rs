//! Client for the remote workcell that executes liquid-handling jobs.
//!
//! All remote interaction goes through [`ToolInvoker`], so the lifecycle and
//! optimizer code can run against a scripted invoker in tests.

pub mod client;
pub mod error;
#[cfg(test)]
pub(crate) mod mock;
pub mod types;

pub use client::{DEFAULT_WORKCELL_URL, RetryConfig, SessionHandle, ToolInvoker, WorkcellClient};
pub use error::WorkcellError;
pub use types::{decode_envelope, decode_tool_result};
