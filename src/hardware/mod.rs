//! Microscope hardware capability interface.
//!
//! The workflow drives the instrument exclusively through the [`Microscope`] trait.
//! Exactly two implementations exist, chosen once at startup:
//!
//! - [`SimulatedMicroscope`]: renders a synthetic frame from a static world map of
//!   particles. Used for development and as the closed-loop oracle for the
//!   coordinate transform.
//! - [`RealMicroscope`]: forwards each operation to the vendor runtime through a
//!   [`VendorLink`].
//!
//! # Contract
//!
//! - Every operation other than `connect` fails with [`SemError::NotConnected`] until
//!   `connect` has succeeded.
//! - `move_stage` and `set_magnification` return only after settling has elapsed.
//! - `acquire_image` always produces a fresh frame; nothing is cached between calls.
//!
//! All methods take `&mut self`: the instrument is owned by exactly one run and no
//! two operations are ever in flight together.

use async_trait::async_trait;
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::{AppResult, SemError};
use crate::transform::StagePosition;

pub mod real;
pub mod simulated;

pub use real::{RealMicroscope, UnavailableVendorLink, VendorLink};
pub use simulated::{SimulatedMicroscope, SimulationConfig, SimulationTiming, WorldParticle};

/// Stage position and magnification as last commanded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub position: StagePosition,
    pub magnification: f64,
}

/// Uniform operations over simulated and real instruments.
#[async_trait]
pub trait Microscope: Send {
    /// Human-readable instrument name.
    fn name(&self) -> String;

    async fn connect(&mut self) -> AppResult<()>;

    async fn set_magnification(&mut self, magnification: f64) -> AppResult<()>;

    async fn move_stage(&mut self, position: StagePosition) -> AppResult<()>;

    async fn auto_focus(&mut self) -> AppResult<()>;

    /// Acquire one full frame at the current position and magnification.
    async fn acquire_image(&mut self) -> AppResult<GrayImage>;

    async fn stage_position(&mut self) -> AppResult<StagePosition>;
}

/// Which [`Microscope`] implementation a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareMode {
    Simulated,
    Real,
}

/// Builds the instrument for `mode`. The real variant gets the vendor link that
/// ships with this build; see [`UnavailableVendorLink`].
pub fn build_microscope(mode: HardwareMode, settings: &Settings) -> Box<dyn Microscope> {
    match mode {
        HardwareMode::Simulated => Box::new(SimulatedMicroscope::new(
            settings.optics.clone(),
            settings.simulation.clone(),
        )),
        HardwareMode::Real => Box::new(RealMicroscope::new(Box::new(UnavailableVendorLink))),
    }
}

/// Tracks whether `connect` has succeeded.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ConnectionGate {
    connected: bool,
}

impl ConnectionGate {
    pub(crate) fn open(&mut self) {
        self.connected = true;
    }

    pub(crate) fn check(&self, operation: &'static str) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            tracing::error!(operation, "hardware operation issued before connect");
            Err(SemError::NotConnected(operation))
        }
    }
}
