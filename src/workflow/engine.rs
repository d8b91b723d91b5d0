//! The targeting run: survey each slot at low magnification, find particles, and
//! re-image each one at the configured high magnifications.
//!
//! # Failure handling
//!
//! Configuration problems (slot with no coordinate, invalid settings, a stage-2
//! magnification that does not exceed stage 1) are logged as warnings and only skip the
//! affected slot or stage. Hardware failures are surfaced as a [`RunError`] naming the
//! failing slot, stage, target, and operation. Under [`FailurePolicy::AbortRun`] that
//! ends the run; under [`FailurePolicy::IsolateSlot`] only the current slot is abandoned.
//!
//! # Concurrency
//!
//! The engine owns the microscope and issues one operation at a time, in program order.
//! There is no cancellation: dropping the future returned by [`TargetingEngine::run`]
//! is the only way to stop a run early.

use std::path::PathBuf;

use image::GrayImage;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::{FailurePolicy, Settings};
use crate::detection::{Detection, Detector, NullDetector, ThresholdDetector};
use crate::error::{FailedStep, RunError, SemError, WorkflowStep};
use crate::hardware::Microscope;
use crate::session::{CaptureArtifact, CaptureStage, OutputSink};
use crate::slots::{ActiveSlots, SlotConfiguration, SlotCoordinateTable, StageTwo};
use crate::transform::{target_position, OpticsConfig, StagePosition};
use crate::workflow::state::{WorkflowEvent, WorkflowState};

const EVENT_CAPACITY: usize = 1024;

/// How a run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every resolvable slot was processed.
    Completed,
    /// No slot configuration was supplied.
    NothingToDo,
}

/// Why a slot produced no captures.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The slot id has no entry in the coordinate table.
    NoCoordinate,
    /// `low_mag` or `high_mag` is not a positive number.
    InvalidSettings(String),
}

/// One stored frame, as seen by the run.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    /// Location returned by the sink.
    pub path: PathBuf,
    pub slot_id: u32,
    pub stage: CaptureStage,
    pub magnification: f64,
    /// Stage position the frame was acquired at.
    pub stage_position: StagePosition,
}

/// Per-slot outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotReport {
    pub slot_id: u32,
    pub sample_name: String,
    /// Set when the slot never reached the microscope.
    pub skipped: Option<SkipReason>,
    /// Stage-2 decision; `None` for skipped slots.
    pub stage_two: Option<StageTwo>,
    /// Detections before truncation to `high_count`.
    pub detections_found: usize,
    /// The primary detector found nothing and thresholding was used.
    pub fallback_used: bool,
    /// Targets whose captures all completed.
    pub targets_visited: usize,
    /// Frames stored per stage.
    pub low_mag_captures: usize,
    pub high_mag_captures: usize,
    pub super_high_mag_captures: usize,
    /// Set when the slot was abandoned under [`FailurePolicy::IsolateSlot`].
    pub failure: Option<String>,
}

impl SlotReport {
    fn new(slot: &SlotConfiguration) -> Self {
        Self {
            slot_id: slot.slot_id,
            sample_name: slot.sample_name.clone(),
            skipped: None,
            stage_two: None,
            detections_found: 0,
            fallback_used: false,
            targets_visited: 0,
            low_mag_captures: 0,
            high_mag_captures: 0,
            super_high_mag_captures: 0,
            failure: None,
        }
    }

    fn count(&mut self, stage: CaptureStage) {
        match stage {
            CaptureStage::LowMag => self.low_mag_captures += 1,
            CaptureStage::HighMag => self.high_mag_captures += 1,
            CaptureStage::SuperHighMag => self.super_high_mag_captures += 1,
        }
    }
}

/// Result of a run that reached `Done`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    /// One report per supplied slot, in run order.
    pub slots: Vec<SlotReport>,
    /// Every stored frame, in acquisition order.
    pub artifacts: Vec<StoredArtifact>,
}

impl RunSummary {
    fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            slots: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn slot(&self, slot_id: u32) -> Option<&SlotReport> {
        self.slots.iter().find(|s| s.slot_id == slot_id)
    }

    /// Stored frames for `stage`, across all slots.
    pub fn count(&self, stage: CaptureStage) -> usize {
        self.artifacts.iter().filter(|a| a.stage == stage).count()
    }

    /// Slots that ran to completion (not skipped, not failed).
    pub fn slots_completed(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.skipped.is_none() && s.failure.is_none())
            .count()
    }
}

/// Position of a step inside the run, used to label failures.
#[derive(Debug, Clone)]
struct StepContext {
    slot_id: u32,
    sample_name: String,
    stage: CaptureStage,
    target: Option<usize>,
}

impl StepContext {
    fn at(&self, stage: CaptureStage, target: Option<usize>) -> Self {
        Self {
            stage,
            target,
            ..self.clone()
        }
    }

    fn fail(&self, step: WorkflowStep, source: SemError) -> RunError {
        RunError {
            step: FailedStep {
                slot_id: Some(self.slot_id),
                sample_name: Some(self.sample_name.clone()),
                stage: Some(self.stage),
                target: self.target,
                step,
            },
            source,
        }
    }
}

/// Drives one microscope through the targeting workflow.
pub struct TargetingEngine {
    microscope: Box<dyn Microscope>,
    detector: Box<dyn Detector>,
    fallback: ThresholdDetector,
    sink: Box<dyn OutputSink>,
    coordinates: SlotCoordinateTable,
    optics: OpticsConfig,
    policy: FailurePolicy,
    state: WorkflowState,
    events: broadcast::Sender<WorkflowEvent>,
}

impl TargetingEngine {
    /// Engine with no primary detector; every slot uses the threshold detector.
    pub fn new(
        microscope: Box<dyn Microscope>,
        sink: Box<dyn OutputSink>,
        settings: &Settings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            microscope,
            detector: Box::new(NullDetector),
            fallback: ThresholdDetector::new(settings.detection.clone()),
            sink,
            coordinates: settings.slots.clone(),
            optics: settings.optics.clone(),
            policy: settings.workflow.failure_policy,
            state: WorkflowState::Idle,
            events,
        }
    }

    /// Use `detector` as the primary detector.
    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Receive progress events. Subscribe before calling [`run`](Self::run).
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: WorkflowEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&mut self, state: WorkflowState) {
        tracing::debug!(%state, "workflow state");
        self.state = state;
        self.emit(WorkflowEvent::StateChanged { state });
    }

    fn fail(&mut self, error: RunError) -> RunError {
        tracing::error!(%error, "run aborted");
        self.transition(WorkflowState::Failed);
        self.emit(WorkflowEvent::Failed {
            error: error.to_string(),
        });
        error
    }

    async fn note(&mut self, message: String) {
        if let Err(error) = self.sink.note(&message).await {
            tracing::warn!(%error, "could not append to session log");
        }
    }

    /// Execute a full run over `slots`, in the order they were supplied.
    ///
    /// `None` or an empty configuration connects, reports the configuration error,
    /// and completes with [`RunOutcome::NothingToDo`].
    pub async fn run(&mut self, slots: Option<&ActiveSlots>) -> Result<RunSummary, RunError> {
        self.transition(WorkflowState::Connecting);
        if let Err(source) = self.microscope.connect().await {
            let error = RunError {
                step: FailedStep::connect(),
                source,
            };
            return Err(self.fail(error));
        }
        let instrument = self.microscope.name();
        tracing::info!(%instrument, "instrument connected");
        self.emit(WorkflowEvent::Connected { instrument });

        let slots = match slots {
            Some(slots) if !slots.is_empty() => slots,
            _ => {
                let error = SemError::Configuration("no active slots provided".to_string());
                tracing::error!(%error, "nothing to do");
                self.emit(WorkflowEvent::NoActiveSlots);
                self.note(error.to_string()).await;
                self.finish_sink().await?;
                self.transition(WorkflowState::Done);
                return Ok(RunSummary::new(RunOutcome::NothingToDo));
            }
        };

        let mut summary = RunSummary::new(RunOutcome::Completed);
        for slot in slots.iter() {
            let mut report = SlotReport::new(&slot);
            let span = tracing::info_span!("slot", slot_id = slot.slot_id, sample = %slot.sample_name);
            let result = self
                .run_slot(&slot, &mut report, &mut summary.artifacts)
                .instrument(span)
                .await;

            if let Err(error) = result {
                match self.policy {
                    FailurePolicy::AbortRun => return Err(self.fail(error)),
                    FailurePolicy::IsolateSlot => {
                        tracing::error!(slot_id = slot.slot_id, %error, "slot abandoned");
                        self.emit(WorkflowEvent::SlotFailed {
                            slot_id: slot.slot_id,
                            error: error.to_string(),
                        });
                        self.note(format!("Slot #{} failed: {error}", slot.slot_id))
                            .await;
                        report.failure = Some(error.to_string());
                    }
                }
            }
            summary.slots.push(report);
        }

        self.finish_sink().await?;
        let slots_completed = summary.slots_completed();
        tracing::info!(slots_completed, "all samples completed");
        self.emit(WorkflowEvent::Finished { slots_completed });
        self.transition(WorkflowState::Done);
        Ok(summary)
    }

    async fn finish_sink(&mut self) -> Result<(), RunError> {
        if let Err(source) = self.sink.finish().await {
            let error = RunError {
                step: FailedStep {
                    slot_id: None,
                    sample_name: None,
                    stage: None,
                    target: None,
                    step: WorkflowStep::Persist,
                },
                source,
            };
            return Err(self.fail(error));
        }
        Ok(())
    }

    /// Skip reason for a slot that cannot run, logging the configuration problem.
    fn check_slot(&self, slot: &SlotConfiguration) -> Result<StagePosition, SkipReason> {
        let Some(base) = self.coordinates.get(slot.slot_id) else {
            tracing::warn!(
                slot_id = slot.slot_id,
                "no coordinates defined for slot, skipping"
            );
            return Err(SkipReason::NoCoordinate);
        };
        if let Err(error) = slot.settings.validate() {
            tracing::warn!(slot_id = slot.slot_id, %error, "invalid slot settings, skipping");
            return Err(SkipReason::InvalidSettings(error.to_string()));
        }
        Ok(base)
    }

    async fn run_slot(
        &mut self,
        slot: &SlotConfiguration,
        report: &mut SlotReport,
        artifacts: &mut Vec<StoredArtifact>,
    ) -> Result<(), RunError> {
        let base = match self.check_slot(slot) {
            Ok(base) => base,
            Err(reason) => {
                self.emit(WorkflowEvent::SlotSkipped {
                    slot_id: slot.slot_id,
                    reason: format!("{reason:?}"),
                });
                report.skipped = Some(reason);
                return Ok(());
            }
        };

        let settings = &slot.settings;
        let stage_two = settings.stage_two();
        report.stage_two = Some(stage_two);
        if let StageTwo::Rejected(high_mag_2) = stage_two {
            tracing::warn!(
                high_mag = settings.high_mag,
                high_mag_2,
                "high_mag_2 does not exceed high_mag; super-high-mag stage disabled"
            );
            self.emit(WorkflowEvent::StageTwoDisabled {
                slot_id: slot.slot_id,
                high_mag: settings.high_mag,
                high_mag_2,
            });
        }

        tracing::info!(x = base.x, y = base.y, "processing sample");
        self.emit(WorkflowEvent::SlotStarted {
            slot_id: slot.slot_id,
            sample_name: slot.sample_name.clone(),
            position: base,
        });
        self.note(format!(
            "Processing sample {} (slot #{}) at ({}, {})",
            slot.sample_name, slot.slot_id, base.x, base.y
        ))
        .await;

        // Low-magnification survey.
        let ctx = StepContext {
            slot_id: slot.slot_id,
            sample_name: slot.sample_name.clone(),
            stage: CaptureStage::LowMag,
            target: None,
        };
        self.transition(WorkflowState::LowMagScan {
            slot_id: slot.slot_id,
        });
        self.microscope
            .move_stage(base)
            .await
            .map_err(|e| ctx.fail(WorkflowStep::MoveStage, e))?;
        let overview = self.acquire_at(&ctx, settings.low_mag).await?;
        let survey_position = self
            .microscope
            .stage_position()
            .await
            .map_err(|e| ctx.fail(WorkflowStep::GetStagePosition, e))?;
        let (width, height) = overview.dimensions();
        self.persist(
            &ctx,
            overview.clone(),
            settings.low_mag,
            survey_position,
            CaptureArtifact::overview_name(),
            report,
            artifacts,
        )
        .await?;

        // Detection.
        self.transition(WorkflowState::Detecting {
            slot_id: slot.slot_id,
        });
        let detections = self.detect(&ctx, &overview, report)?;
        drop(overview);

        let retained: Vec<Detection> = detections.into_iter().take(settings.high_count).collect();
        tracing::info!(
            found = report.detections_found,
            retained = retained.len(),
            "particles selected"
        );
        self.emit(WorkflowEvent::ParticlesDetected {
            slot_id: slot.slot_id,
            detector: if report.fallback_used {
                self.fallback.name().to_string()
            } else {
                self.detector.name().to_string()
            },
            found: report.detections_found,
            retained: retained.len(),
        });

        // Targeted high-magnification captures.
        for (index, detection) in retained.iter().enumerate() {
            let target = index + 1;
            let position = target_position(
                &self.optics,
                detection,
                survey_position,
                settings.low_mag,
                width,
                height,
            );
            tracing::info!(target, x = position.x, y = position.y, "moving to target");
            self.emit(WorkflowEvent::TargetComputed {
                slot_id: slot.slot_id,
                target,
                position,
            });

            let high_ctx = ctx.at(CaptureStage::HighMag, Some(target));
            self.transition(WorkflowState::MoveToTarget {
                slot_id: slot.slot_id,
                target,
            });
            self.microscope
                .move_stage(position)
                .await
                .map_err(|e| high_ctx.fail(WorkflowStep::MoveStage, e))?;

            self.transition(WorkflowState::HighMag1Capture {
                slot_id: slot.slot_id,
                target,
            });
            let frame = self.acquire_at(&high_ctx, settings.high_mag).await?;
            self.persist(
                &high_ctx,
                frame,
                settings.high_mag,
                position,
                CaptureArtifact::particle_name(target, settings.high_mag),
                report,
                artifacts,
            )
            .await?;

            if let StageTwo::Enabled(high_mag_2) = stage_two {
                let super_ctx = ctx.at(CaptureStage::SuperHighMag, Some(target));
                self.transition(WorkflowState::HighMag2Capture {
                    slot_id: slot.slot_id,
                    target,
                });
                let frame = self.acquire_at(&super_ctx, high_mag_2).await?;
                self.persist(
                    &super_ctx,
                    frame,
                    high_mag_2,
                    position,
                    CaptureArtifact::particle_name(target, high_mag_2),
                    report,
                    artifacts,
                )
                .await?;
            }
            report.targets_visited += 1;
        }

        self.emit(WorkflowEvent::SlotFinished {
            slot_id: slot.slot_id,
            targets_visited: report.targets_visited,
        });
        self.note(format!(
            "Slot #{} done: {} of {} particles imaged",
            slot.slot_id, report.targets_visited, report.detections_found
        ))
        .await;
        Ok(())
    }

    /// Set magnification, auto-focus, acquire.
    async fn acquire_at(
        &mut self,
        ctx: &StepContext,
        magnification: f64,
    ) -> Result<GrayImage, RunError> {
        tracing::debug!(stage = %ctx.stage, magnification, "acquiring");
        self.microscope
            .set_magnification(magnification)
            .await
            .map_err(|e| ctx.fail(WorkflowStep::SetMagnification, e))?;
        self.microscope
            .auto_focus()
            .await
            .map_err(|e| ctx.fail(WorkflowStep::AutoFocus, e))?;
        self.microscope
            .acquire_image()
            .await
            .map_err(|e| ctx.fail(WorkflowStep::AcquireImage, e))
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist(
        &mut self,
        ctx: &StepContext,
        image: GrayImage,
        magnification: f64,
        stage_position: StagePosition,
        name: String,
        report: &mut SlotReport,
        artifacts: &mut Vec<StoredArtifact>,
    ) -> Result<(), RunError> {
        let artifact = CaptureArtifact {
            image,
            slot_id: ctx.slot_id,
            sample_name: ctx.sample_name.clone(),
            stage: ctx.stage,
            magnification,
            stage_position,
            name,
        };
        let path = self
            .sink
            .store(artifact)
            .await
            .map_err(|e| ctx.fail(WorkflowStep::Persist, e))?;

        report.count(ctx.stage);
        self.emit(WorkflowEvent::Captured {
            slot_id: ctx.slot_id,
            stage: ctx.stage,
            magnification,
            path: path.clone(),
        });
        artifacts.push(StoredArtifact {
            path,
            slot_id: ctx.slot_id,
            stage: ctx.stage,
            magnification,
            stage_position,
        });
        Ok(())
    }

    /// Primary detector, falling back to thresholding when it finds nothing.
    fn detect(
        &self,
        ctx: &StepContext,
        image: &GrayImage,
        report: &mut SlotReport,
    ) -> Result<Vec<Detection>, RunError> {
        let mut detections = self
            .detector
            .detect(image)
            .map_err(|e| ctx.fail(WorkflowStep::Detect, e))?;
        if detections.is_empty() {
            tracing::debug!(detector = self.detector.name(), "no detections, using fallback");
            self.emit(WorkflowEvent::FallbackDetectorUsed {
                slot_id: ctx.slot_id,
            });
            report.fallback_used = true;
            detections = self
                .fallback
                .detect(image)
                .map_err(|e| ctx.fail(WorkflowStep::Detect, e))?;
        }
        report.detections_found = detections.len();
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{SimulatedMicroscope, SimulationTiming, WorldParticle};
    use crate::session::MemorySink;
    use crate::slots::{SlotCoordinate, SlotSettings};
    use tracing_test::traced_test;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.simulation.seed = Some(3);
        settings.simulation.timing = SimulationTiming::instant();
        settings.simulation.particles = vec![WorldParticle::new(12.0, 8.0)];
        settings.slots = vec![SlotCoordinate {
            id: 1,
            x: 10.0,
            y: 10.0,
        }]
        .into();
        settings
    }

    fn engine(settings: &Settings) -> TargetingEngine {
        let microscope =
            SimulatedMicroscope::new(settings.optics.clone(), settings.simulation.clone());
        TargetingEngine::new(Box::new(microscope), Box::new(MemorySink::new()), settings)
    }

    fn slot(high_mag: f64, high_mag_2: f64) -> SlotSettings {
        SlotSettings {
            low_mag: 1000.0,
            high_mag,
            high_mag_2,
            high_count: 1,
        }
    }

    #[tokio::test]
    async fn starts_idle_and_ends_done() {
        let settings = settings();
        let mut engine = engine(&settings);
        assert_eq!(engine.state(), WorkflowState::Idle);

        let slots = ActiveSlots::new().with_slot(1, "S", slot(5000.0, 0.0));
        let summary = engine.run(Some(&slots)).await.unwrap();
        assert_eq!(engine.state(), WorkflowState::Done);
        assert_eq!(summary.slots_completed(), 1);
        assert_eq!(summary.count(CaptureStage::HighMag), 1);
        assert_eq!(summary.slot(1).unwrap().stage_two, Some(StageTwo::Disabled));
    }

    #[tokio::test]
    #[traced_test]
    async fn rejected_stage_two_is_logged_as_warning() {
        let settings = settings();
        let mut engine = engine(&settings);
        let slots = ActiveSlots::new().with_slot(1, "S", slot(20_000.0, 10_000.0));

        let summary = engine.run(Some(&slots)).await.unwrap();
        assert_eq!(summary.count(CaptureStage::SuperHighMag), 0);
        assert_eq!(
            summary.slot(1).unwrap().stage_two,
            Some(StageTwo::Rejected(10_000.0))
        );
        assert!(logs_contain("super-high-mag stage disabled"));
    }

    #[tokio::test]
    async fn out_of_range_stage_two_keeps_stage_one_outputs() {
        for high_mag_2 in [-1.0, f64::NAN] {
            let settings = settings();
            let mut engine = engine(&settings);
            let slots = ActiveSlots::new().with_slot(1, "S", slot(5000.0, high_mag_2));

            let summary = engine.run(Some(&slots)).await.unwrap();
            let report = summary.slot(1).unwrap();
            assert_eq!(report.skipped, None, "high_mag_2 = {high_mag_2}");
            assert!(matches!(report.stage_two, Some(StageTwo::Rejected(_))));
            assert_eq!(summary.count(CaptureStage::LowMag), 1);
            assert_eq!(summary.count(CaptureStage::HighMag), 1);
            assert_eq!(summary.count(CaptureStage::SuperHighMag), 0);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_coordinate_is_logged_and_skipped() {
        let settings = settings();
        let mut engine = engine(&settings);
        let slots = ActiveSlots::new().with_slot(7, "Orphan", slot(5000.0, 0.0));

        let summary = engine.run(Some(&slots)).await.unwrap();
        assert_eq!(
            summary.slot(7).unwrap().skipped,
            Some(SkipReason::NoCoordinate)
        );
        assert!(summary.artifacts.is_empty());
        assert!(logs_contain("no coordinates defined for slot"));
    }

    #[tokio::test]
    async fn invalid_settings_skip_the_slot() {
        let settings = settings();
        let mut engine = engine(&settings);
        let slots = ActiveSlots::new().with_slot(1, "S", slot(0.0, 0.0));

        let summary = engine.run(Some(&slots)).await.unwrap();
        assert!(matches!(
            summary.slot(1).unwrap().skipped,
            Some(SkipReason::InvalidSettings(_))
        ));
        assert!(summary.artifacts.is_empty());
    }

    #[test]
    fn step_context_labels_failures() {
        let ctx = StepContext {
            slot_id: 4,
            sample_name: "NCM_04".into(),
            stage: CaptureStage::LowMag,
            target: None,
        };
        let err = ctx
            .at(CaptureStage::SuperHighMag, Some(2))
            .fail(WorkflowStep::AutoFocus, SemError::operation("auto_focus", "lost"));
        assert_eq!(err.step.slot_id, Some(4));
        assert_eq!(err.step.stage, Some(CaptureStage::SuperHighMag));
        assert_eq!(err.step.target, Some(2));
        assert!(err.to_string().contains("auto_focus"));
    }
}
