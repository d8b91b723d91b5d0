//! Particle targeting workflow.
//!
//! [`TargetingEngine`] walks the active slots, publishing [`WorkflowEvent`]s and
//! handing every frame to an [`OutputSink`](crate::session::OutputSink).

pub mod engine;
pub mod state;

pub use engine::{RunOutcome, RunSummary, SkipReason, SlotReport, StoredArtifact, TargetingEngine};
pub use state::{WorkflowEvent, WorkflowState};
