//! Workflow states and the event stream hosts observe.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::session::CaptureStage;
use crate::transform::StagePosition;

/// Where the engine is in a run.
///
/// ```text
/// Idle → Connecting → ┬→ LowMagScan → Detecting → ┬→ MoveToTarget → HighMag1Capture → (HighMag2Capture) ┐
///                     │                           └────────────────── next target ←────────────────────┘
///                     └────────────── next slot ←───────────────────────────────────────────────────────→ Done
/// any state ──(unrecoverable error)──→ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    /// Constructed, not yet run.
    Idle,
    Connecting,
    /// Moving to the slot and taking the overview frame.
    LowMagScan { slot_id: u32 },
    Detecting { slot_id: u32 },
    /// `target` is 1-based within the slot.
    MoveToTarget { slot_id: u32, target: usize },
    HighMag1Capture { slot_id: u32, target: usize },
    HighMag2Capture { slot_id: u32, target: usize },
    /// Every resolvable slot was processed.
    Done,
    /// An unrecoverable error ended the run.
    Failed,
}

impl WorkflowState {
    /// A run has ended in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowState::Idle => f.write_str("idle"),
            WorkflowState::Connecting => f.write_str("connecting"),
            WorkflowState::LowMagScan { slot_id } => write!(f, "low-mag scan (slot {slot_id})"),
            WorkflowState::Detecting { slot_id } => write!(f, "detecting (slot {slot_id})"),
            WorkflowState::MoveToTarget { slot_id, target } => {
                write!(f, "moving to target {target} (slot {slot_id})")
            }
            WorkflowState::HighMag1Capture { slot_id, target } => {
                write!(f, "high-mag capture of target {target} (slot {slot_id})")
            }
            WorkflowState::HighMag2Capture { slot_id, target } => {
                write!(f, "super-high-mag capture of target {target} (slot {slot_id})")
            }
            WorkflowState::Done => f.write_str("done"),
            WorkflowState::Failed => f.write_str("failed"),
        }
    }
}

/// Progress notifications published while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The engine entered `state`.
    StateChanged {
        state: WorkflowState,
    },
    /// `connect` succeeded.
    Connected {
        instrument: String,
    },
    /// No slot configuration was supplied; nothing to do.
    NoActiveSlots,
    /// A slot passed its checks and the stage is heading to `position`.
    SlotStarted {
        slot_id: u32,
        sample_name: String,
        position: StagePosition,
    },
    /// A slot was skipped for a configuration problem; no hardware call was made.
    SlotSkipped {
        slot_id: u32,
        reason: String,
    },
    /// `high_mag_2` is set but not usable; only stage 1 runs for this slot.
    StageTwoDisabled {
        slot_id: u32,
        high_mag: f64,
        high_mag_2: f64,
    },
    /// A frame was handed to the sink and stored at `path`.
    Captured {
        slot_id: u32,
        stage: CaptureStage,
        magnification: f64,
        path: PathBuf,
    },
    /// The primary detector found nothing; thresholding took over.
    FallbackDetectorUsed {
        slot_id: u32,
    },
    /// Detection finished; `retained` of `found` will be imaged.
    ParticlesDetected {
        slot_id: u32,
        detector: String,
        found: usize,
        retained: usize,
    },
    /// Stage position for a target, from the low-mag frame.
    TargetComputed {
        slot_id: u32,
        target: usize,
        position: StagePosition,
    },
    /// Every retained target of the slot was imaged.
    SlotFinished {
        slot_id: u32,
        targets_visited: usize,
    },
    /// A slot was abandoned under the slot-isolation policy.
    SlotFailed {
        slot_id: u32,
        error: String,
    },
    /// The run reached `Done`.
    Finished {
        slots_completed: usize,
    },
    /// The run aborted; `error` names the failing step.
    Failed {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_done_and_failed_are_terminal() {
        assert!(WorkflowState::Done.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(!WorkflowState::Idle.is_terminal());
        assert!(!WorkflowState::Detecting { slot_id: 1 }.is_terminal());
    }

    #[test]
    fn events_serialize_with_tags() {
        let event = WorkflowEvent::StateChanged {
            state: WorkflowState::MoveToTarget {
                slot_id: 2,
                target: 1,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["state"]["state"], "move_to_target");
        assert_eq!(json["state"]["slot_id"], 2);
    }
}
