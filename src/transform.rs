//! Pixel-to-stage coordinate transform.
//!
//! The field of view of the column shrinks linearly with magnification:
//! `fov = K / magnification`. The same constant `K` drives the simulated
//! renderer, so a particle drawn by the simulator and detected in the frame
//! maps back to its world position through [`target_position`].

use serde::{Deserialize, Serialize};

use crate::detection::Detection;

/// A world (stage-space) coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
}

impl StagePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &StagePosition) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Orientation of a stage axis relative to the image axis.
///
/// `Positive` means a pixel offset towards larger image coordinates corresponds
/// to a stage offset towards larger world coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisSign {
    #[default]
    Positive,
    Negative,
}

impl AxisSign {
    pub fn factor(self) -> f64 {
        match self {
            AxisSign::Positive => 1.0,
            AxisSign::Negative => -1.0,
        }
    }
}

/// Instrument constants shared by the simulated renderer and the transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticsConfig {
    /// `K` in `fov = K / magnification`, in stage units.
    pub fov_constant: f64,
    /// Edge length of the square frame in pixels.
    pub frame_size: u32,
    pub axis_sign_x: AxisSign,
    pub axis_sign_y: AxisSign,
}

impl Default for OpticsConfig {
    fn default() -> Self {
        Self {
            fov_constant: 200_000.0,
            frame_size: 1024,
            axis_sign_x: AxisSign::Positive,
            axis_sign_y: AxisSign::Positive,
        }
    }
}

impl OpticsConfig {
    /// Physical width of the visible area at `magnification`.
    pub fn fov(&self, magnification: f64) -> f64 {
        self.fov_constant / magnification
    }

    /// World distance covered by one pixel of an image `image_width_px` wide.
    pub fn pixel_scale(&self, magnification: f64, image_width_px: u32) -> f64 {
        self.fov(magnification) / f64::from(image_width_px)
    }
}

/// Stage position that centres `detection` in the field of view.
///
/// `image_width`/`image_height` are the dimensions of the frame the detection
/// came from, `stage` the position the frame was acquired at. The result is
/// neither rounded nor clamped to the travel range.
pub fn target_position(
    optics: &OpticsConfig,
    detection: &Detection,
    stage: StagePosition,
    magnification: f64,
    image_width: u32,
    image_height: u32,
) -> StagePosition {
    let scale = optics.pixel_scale(magnification, image_width);
    let dx_px = detection.x - f64::from(image_width) / 2.0;
    let dy_px = detection.y - f64::from(image_height) / 2.0;

    StagePosition {
        x: stage.x + dx_px * scale * optics.axis_sign_x.factor(),
        y: stage.y + dy_px * scale * optics.axis_sign_y.factor(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection_at(x: f64, y: f64) -> Detection {
        Detection::new(x, y, 61.0, 61.0, 1.0)
    }

    #[test]
    fn fov_matches_instrument_constant() {
        let optics = OpticsConfig::default();
        assert_eq!(optics.fov(1000.0), 200.0);
        assert_eq!(optics.pixel_scale(1000.0, 1024), 200.0 / 1024.0);
    }

    #[test]
    fn fov_shrinks_as_magnification_grows() {
        let optics = OpticsConfig::default();
        let mags = [1.0, 50.0, 500.0, 1000.0, 5000.0, 20_000.0, 50_000.0, 1.0e6];
        for pair in mags.windows(2) {
            assert!(
                optics.fov(pair[0]) > optics.fov(pair[1]),
                "fov({}) should exceed fov({})",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn centred_detection_keeps_stage_position() {
        let optics = OpticsConfig::default();
        let stage = StagePosition::new(10.0, 20.0);
        let target = target_position(&optics, &detection_at(512.0, 512.0), stage, 1000.0, 1024, 1024);
        assert_eq!(target, stage);
    }

    #[test]
    fn offset_scales_with_pixel_size() {
        let optics = OpticsConfig::default();
        let stage = StagePosition::new(10.0, 20.0);
        // 256 px right and 128 px up at 200 units / 1024 px.
        let target = target_position(&optics, &detection_at(768.0, 384.0), stage, 1000.0, 1024, 1024);
        assert!((target.x - 60.0).abs() < 1e-9);
        assert!((target.y - -5.0).abs() < 1e-9);
    }

    #[test]
    fn negative_axis_sign_mirrors_offset() {
        let optics = OpticsConfig {
            axis_sign_x: AxisSign::Negative,
            ..OpticsConfig::default()
        };
        let stage = StagePosition::new(0.0, 0.0);
        let target = target_position(&optics, &detection_at(768.0, 768.0), stage, 1000.0, 1024, 1024);
        assert!((target.x - -50.0).abs() < 1e-9);
        assert!((target.y - 50.0).abs() < 1e-9);
    }

    #[test]
    fn targets_outside_travel_are_not_clamped() {
        let optics = OpticsConfig::default();
        let stage = StagePosition::new(-1.0e6, 1.0e6);
        let target = target_position(&optics, &detection_at(0.0, 1024.0), stage, 1.0, 1024, 1024);
        assert!((target.x - (-1.0e6 - 100_000.0)).abs() < 1e-6);
        assert!((target.y - (1.0e6 + 100_000.0)).abs() < 1e-6);
    }
}
