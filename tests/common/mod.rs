//! Common test utilities for smart_sem integration tests
//!
//! This module provides:
//! - A microscope wrapper that records every operation and can inject failures
//! - A shareable in-memory sink
//! - Settings and slot builders with zero simulator delays

#![allow(dead_code)] // Not every test binary uses every helper

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::GrayImage;
use tokio::sync::Mutex as AsyncMutex;

use smart_sem::detection::{Detection, Detector};
use smart_sem::hardware::{Microscope, SimulatedMicroscope, SimulationTiming, WorldParticle};
use smart_sem::session::{CaptureArtifact, MemorySink, OutputSink};
use smart_sem::slots::{SlotCoordinate, SlotSettings};
use smart_sem::transform::StagePosition;
use smart_sem::{AppResult, SemError, Settings};

/// One hardware call as seen by [`RecordingMicroscope`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Connect,
    SetMagnification(f64),
    MoveStage(StagePosition),
    AutoFocus,
    AcquireImage,
    StagePosition,
}

/// Operation kind, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Connect,
    SetMagnification,
    MoveStage,
    AutoFocus,
    AcquireImage,
    StagePosition,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Connect => OpKind::Connect,
            Op::SetMagnification(_) => OpKind::SetMagnification,
            Op::MoveStage(_) => OpKind::MoveStage,
            Op::AutoFocus => OpKind::AutoFocus,
            Op::AcquireImage => OpKind::AcquireImage,
            Op::StagePosition => OpKind::StagePosition,
        }
    }
}

/// Shared handle onto the operations a [`RecordingMicroscope`] has seen.
#[derive(Debug, Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<Op>>>);

impl OpLog {
    pub fn ops(&self) -> Vec<Op> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, kind: OpKind) -> usize {
        self.ops().iter().filter(|op| op.kind() == kind).count()
    }

    pub fn moves(&self) -> Vec<StagePosition> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::MoveStage(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn push(&self, op: Op) -> usize {
        let mut ops = self.0.lock().unwrap();
        let kind = op.kind();
        ops.push(op);
        ops.iter().filter(|o| o.kind() == kind).count()
    }
}

/// Wraps a microscope, logging each call and optionally failing the n-th call of a kind.
pub struct RecordingMicroscope<M> {
    inner: M,
    log: OpLog,
    fail_on: Option<(OpKind, usize)>,
}

impl<M: Microscope> RecordingMicroscope<M> {
    pub fn new(inner: M) -> (Self, OpLog) {
        let log = OpLog::default();
        (
            Self {
                inner,
                log: log.clone(),
                fail_on: None,
            },
            log,
        )
    }

    /// Fail the `occurrence`-th (1-based) call of `kind`.
    pub fn failing_on(mut self, kind: OpKind, occurrence: usize) -> Self {
        self.fail_on = Some((kind, occurrence));
        self
    }

    fn record(&self, op: Op, operation: &'static str) -> AppResult<()> {
        let kind = op.kind();
        let seen = self.log.push(op);
        if self.fail_on == Some((kind, seen)) {
            return Err(SemError::operation(operation, "injected fault"));
        }
        Ok(())
    }
}

#[async_trait]
impl<M: Microscope> Microscope for RecordingMicroscope<M> {
    fn name(&self) -> String {
        format!("recording({})", self.inner.name())
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.record(Op::Connect, "connect")?;
        self.inner.connect().await
    }

    async fn set_magnification(&mut self, magnification: f64) -> AppResult<()> {
        self.record(Op::SetMagnification(magnification), "set_magnification")?;
        self.inner.set_magnification(magnification).await
    }

    async fn move_stage(&mut self, position: StagePosition) -> AppResult<()> {
        self.record(Op::MoveStage(position), "move_stage")?;
        self.inner.move_stage(position).await
    }

    async fn auto_focus(&mut self) -> AppResult<()> {
        self.record(Op::AutoFocus, "auto_focus")?;
        self.inner.auto_focus().await
    }

    async fn acquire_image(&mut self) -> AppResult<GrayImage> {
        self.record(Op::AcquireImage, "acquire_image")?;
        self.inner.acquire_image().await
    }

    async fn stage_position(&mut self) -> AppResult<StagePosition> {
        self.record(Op::StagePosition, "stage_position")?;
        self.inner.stage_position().await
    }
}

/// A [`MemorySink`] the test keeps a handle to after the engine takes ownership.
#[derive(Debug, Clone, Default)]
pub struct SharedSink(Arc<AsyncMutex<MemorySink>>);

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn inner(&self) -> tokio::sync::MutexGuard<'_, MemorySink> {
        self.0.lock().await
    }
}

#[async_trait]
impl OutputSink for SharedSink {
    async fn store(&mut self, artifact: CaptureArtifact) -> AppResult<std::path::PathBuf> {
        self.0.lock().await.store(artifact).await
    }

    async fn note(&mut self, message: &str) -> AppResult<()> {
        self.0.lock().await.note(message).await
    }

    async fn finish(&mut self) -> AppResult<()> {
        self.0.lock().await.finish().await
    }
}

/// Returns a fixed list of detections regardless of the image.
pub struct FixedDetector(pub Vec<Detection>);

impl Detector for FixedDetector {
    fn name(&self) -> &str {
        "fixed"
    }

    fn detect(&self, _image: &GrayImage) -> AppResult<Vec<Detection>> {
        Ok(self.0.clone())
    }
}

/// Default settings with a seeded, zero-delay simulator holding `particles`
/// and the given slot coordinates.
pub fn test_settings(particles: &[(f64, f64)], slots: &[(u32, f64, f64)]) -> Settings {
    let mut settings = Settings::default();
    settings.simulation.seed = Some(7);
    settings.simulation.timing = SimulationTiming::instant();
    settings.simulation.particles = particles
        .iter()
        .map(|&(x, y)| WorldParticle::new(x, y))
        .collect();
    settings.slots = slots
        .iter()
        .map(|&(id, x, y)| SlotCoordinate { id, x, y })
        .collect::<Vec<_>>()
        .into();
    settings
}

/// Simulated microscope for `settings`, wrapped for recording.
pub fn recording_simulator(settings: &Settings) -> (RecordingMicroscope<SimulatedMicroscope>, OpLog) {
    RecordingMicroscope::new(SimulatedMicroscope::new(
        settings.optics.clone(),
        settings.simulation.clone(),
    ))
}

pub fn slot_settings(low_mag: f64, high_mag: f64, high_mag_2: f64, high_count: usize) -> SlotSettings {
    SlotSettings {
        low_mag,
        high_mag,
        high_mag_2,
        high_count,
    }
}
