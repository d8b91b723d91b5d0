//! Particle detection capability.
//!
//! Detectors turn a grayscale frame into pixel-space bounding boxes. The model-backed
//! detector is an external capability; this module provides the trait it plugs into,
//! a [`NullDetector`] standing in for "no usable model", and the deterministic
//! [`ThresholdDetector`] the workflow falls back to whenever the primary detector
//! returns nothing.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

/// A particle found in a single frame.
///
/// `x`/`y` are the bounding box centre and `w`/`h` its size, all in pixels.
/// Detections carry no identity beyond their index in one capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub confidence: f64,
}

impl Detection {
    /// Builds a detection, clamping `confidence` into `[0, 1]`.
    pub fn new(x: f64, y: f64, w: f64, h: f64, confidence: f64) -> Self {
        Self {
            x,
            y,
            w,
            h,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Image → detections. Implementations must be pure per image.
pub trait Detector: Send + Sync {
    /// Short name used in logs and events.
    fn name(&self) -> &str;

    fn detect(&self, image: &GrayImage) -> AppResult<Vec<Detection>>;
}

/// Detector used when no model is available; never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn name(&self) -> &str {
        "none"
    }

    fn detect(&self, _image: &GrayImage) -> AppResult<Vec<Detection>> {
        Ok(Vec::new())
    }
}

/// Threshold settings for the fallback detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Pixels strictly brighter than this belong to a particle.
    pub threshold: u8,
    /// Components with fewer pixels are discarded.
    pub min_area: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 200,
            min_area: 1,
        }
    }
}

/// Binary threshold followed by 8-connected component labelling.
///
/// Components are reported in raster order of their first pixel (top-to-bottom,
/// left-to-right), each with confidence 1.0 and the centre of its bounding box.
#[derive(Debug, Clone, Default)]
pub struct ThresholdDetector {
    config: DetectionConfig,
}

impl ThresholdDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }
}

struct Bounds {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
}

impl Detector for ThresholdDetector {
    fn name(&self) -> &str {
        "threshold"
    }

    fn detect(&self, image: &GrayImage) -> AppResult<Vec<Detection>> {
        let (width, height) = image.dimensions();
        let w = width as usize;
        let threshold = self.config.threshold;
        let mut visited = vec![false; w * height as usize];
        let mut stack: Vec<(u32, u32)> = Vec::new();
        let mut detections = Vec::new();

        for y in 0..height {
            for x in 0..width {
                let idx = y as usize * w + x as usize;
                if visited[idx] || image.get_pixel(x, y)[0] <= threshold {
                    continue;
                }

                visited[idx] = true;
                stack.push((x, y));
                let mut bounds = Bounds {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    area: 0,
                };

                while let Some((cx, cy)) = stack.pop() {
                    bounds.area += 1;
                    bounds.min_x = bounds.min_x.min(cx);
                    bounds.max_x = bounds.max_x.max(cx);
                    bounds.min_y = bounds.min_y.min(cy);
                    bounds.max_y = bounds.max_y.max(cy);

                    for ny in cy.saturating_sub(1)..=(cy + 1).min(height - 1) {
                        for nx in cx.saturating_sub(1)..=(cx + 1).min(width - 1) {
                            let nidx = ny as usize * w + nx as usize;
                            if !visited[nidx] && image.get_pixel(nx, ny)[0] > threshold {
                                visited[nidx] = true;
                                stack.push((nx, ny));
                            }
                        }
                    }
                }

                if bounds.area < self.config.min_area {
                    continue;
                }

                let box_w = f64::from(bounds.max_x - bounds.min_x + 1);
                let box_h = f64::from(bounds.max_y - bounds.min_y + 1);
                detections.push(Detection::new(
                    f64::from(bounds.min_x) + box_w / 2.0,
                    f64::from(bounds.min_y) + box_h / 2.0,
                    box_w,
                    box_h,
                    1.0,
                ));
            }
        }

        tracing::debug!(count = detections.len(), "threshold detector finished");
        Ok(detections)
    }
}
