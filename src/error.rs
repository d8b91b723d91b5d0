//! Custom error types for the application.
//!
//! This module defines the primary error type, `SemError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent way to report everything
//! from configuration mistakes to hardware faults raised mid-run.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically a malformed TOML file or an
//!   environment override of the wrong type.
//! - **`Configuration`**: Semantic configuration problems (invalid slot settings, a slot
//!   with no coordinate entry). The workflow absorbs these: the slot or stage is skipped
//!   and a warning is logged.
//! - **`HardwareConnection`**: The microscope could not be reached. Fatal before any slot
//!   is processed.
//! - **`HardwareOperation`**: A move, focus, magnification change, or capture failed
//!   mid-run. Fatal to the run unless the slot-isolation policy is active.
//! - **`NotConnected`**: A hardware operation was issued before `connect` succeeded. This is
//!   a programming error in the caller and is reported rather than ignored.
//!
//! An empty detector result is deliberately *not* an error: it triggers the fallback
//! detector.
//!
//! [`RunError`] wraps a `SemError` with the exact workflow step that failed, so the
//! operator always sees which slot, magnification stage, and operation aborted the run.

use std::fmt;

use thiserror::Error;

use crate::session::CaptureStage;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SemError>;

#[derive(Error, Debug)]
pub enum SemError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Hardware connection error: {0}")]
    HardwareConnection(String),

    #[error("Hardware operation '{operation}' failed: {reason}")]
    HardwareOperation {
        operation: &'static str,
        reason: String,
    },

    #[error("Hardware operation '{0}' called before connect")]
    NotConnected(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<figment::Error> for SemError {
    fn from(err: figment::Error) -> Self {
        SemError::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for SemError {
    fn from(err: serde_json::Error) -> Self {
        SemError::Serialization(err.to_string())
    }
}

impl SemError {
    /// Shorthand for building a [`SemError::HardwareOperation`].
    pub fn operation(operation: &'static str, reason: impl Into<String>) -> Self {
        SemError::HardwareOperation {
            operation,
            reason: reason.into(),
        }
    }
}

/// The workflow step during which a run-level failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStep {
    Connect,
    MoveStage,
    SetMagnification,
    AutoFocus,
    AcquireImage,
    GetStagePosition,
    Detect,
    Persist,
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStep::Connect => "connect",
            WorkflowStep::MoveStage => "move_stage",
            WorkflowStep::SetMagnification => "set_magnification",
            WorkflowStep::AutoFocus => "auto_focus",
            WorkflowStep::AcquireImage => "acquire_image",
            WorkflowStep::GetStagePosition => "get_stage_position",
            WorkflowStep::Detect => "detect",
            WorkflowStep::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Identifies where in the run a failure happened.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedStep {
    /// `None` when the failure happened before any slot (connection).
    pub slot_id: Option<u32>,
    pub sample_name: Option<String>,
    pub stage: Option<CaptureStage>,
    /// 1-based target index within the slot, if the failure was inside the target loop.
    pub target: Option<usize>,
    pub step: WorkflowStep,
}

impl FailedStep {
    pub(crate) fn connect() -> Self {
        Self {
            slot_id: None,
            sample_name: None,
            stage: None,
            target: None,
            step: WorkflowStep::Connect,
        }
    }
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step '{}'", self.step)?;
        if let (Some(slot), Some(name)) = (self.slot_id, self.sample_name.as_deref()) {
            write!(f, " of slot #{slot} ('{name}')")?;
        }
        if let Some(stage) = self.stage {
            write!(f, " during {stage}")?;
        }
        if let Some(target) = self.target {
            write!(f, " on target #{target}")?;
        }
        Ok(())
    }
}

/// A run aborted at an identified step.
#[derive(Error, Debug)]
#[error("Run aborted at {step}: {source}")]
pub struct RunError {
    pub step: FailedStep,
    #[source]
    pub source: SemError,
}
