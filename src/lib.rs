//! Core library for the smart_sem application.
//!
//! Automated particle targeting on a scanning electron microscope: survey each sample
//! slot at low magnification, detect particles, convert their pixel positions to stage
//! coordinates, and re-image each one at higher magnification. The microscope is either
//! simulated or driven through a vendor link; the command-line binary and tests share
//! the same [`workflow::TargetingEngine`].

pub mod config;
pub mod detection;
pub mod error;
pub mod hardware;
pub mod session;
pub mod slots;
pub mod transform;
pub mod workflow;

pub use config::{FailurePolicy, Settings};
pub use error::{AppResult, RunError, SemError};
pub use workflow::{RunSummary, TargetingEngine};
