//! Closed-loop growth-media optimization on a remote liquid-handling workcell.
//!
//! A round clamps a center composition ([`composition`]), turns it into the
//! transfers for one plate column ([`transfer`]), runs the job on the
//! workcell ([`lifecycle`] over [`workcell`]), reads growth back
//! ([`measurement`]) and steps the center along the measured gradient
//! ([`optimizer`]).

pub mod cli;
pub mod composition;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod measurement;
pub mod optimizer;
pub mod registration;
pub mod transfer;
pub mod ui;
pub mod workcell;

pub use error::WetloopError;
