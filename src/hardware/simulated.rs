//! Simulated SEM
//!
//! Provides a virtual instrument for running the full workflow without a column.
//! All delays use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Rendering
//!
//! Each acquisition allocates a square frame, fills it with uniform background noise
//! below the detection threshold, and draws every world particle that lies strictly
//! inside the current field of view as a bright filled disc. The field of view comes
//! from the same [`OpticsConfig`] the coordinate transform uses, so
//! capture → detect → transform recovers particle positions to within one pixel.
//!
//! # Timing (defaults)
//!
//! - stage move: 1 s
//! - magnification change: 0.5 s
//! - auto-focus: 1 s
//! - frame acquisition: 2 s

use async_trait::async_trait;
use image::{GrayImage, Luma};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use crate::error::AppResult;
use crate::hardware::{ConnectionGate, Microscope, StageState};
use crate::transform::{OpticsConfig, StagePosition};

/// Intensity of rendered particles.
const PARTICLE_INTENSITY: u8 = 255;

/// A fixed particle in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldParticle {
    pub x: f64,
    pub y: f64,
}

impl WorldParticle {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn position(&self) -> StagePosition {
        StagePosition::new(self.x, self.y)
    }
}

/// Simulated settling and acquisition delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationTiming {
    pub move_ms: u64,
    pub magnification_ms: u64,
    pub focus_ms: u64,
    pub acquire_ms: u64,
}

impl Default for SimulationTiming {
    fn default() -> Self {
        Self {
            move_ms: 1000,
            magnification_ms: 500,
            focus_ms: 1000,
            acquire_ms: 2000,
        }
    }
}

impl SimulationTiming {
    /// No delays at all; for tests and dry runs.
    pub fn instant() -> Self {
        Self {
            move_ms: 0,
            magnification_ms: 0,
            focus_ms: 0,
            acquire_ms: 0,
        }
    }
}

/// World model and rendering parameters of the simulated instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Radius of a rendered particle, in pixels.
    pub particle_radius: u32,
    /// Background noise is drawn uniformly from `[0, noise_ceiling)`.
    pub noise_ceiling: u8,
    /// Fixed RNG seed for reproducible frames; entropy-seeded when absent.
    pub seed: Option<u64>,
    pub particles: Vec<WorldParticle>,
    pub timing: SimulationTiming,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            particle_radius: 30,
            noise_ceiling: 50,
            seed: None,
            particles: default_world(),
            timing: SimulationTiming::default(),
        }
    }
}

/// Three clusters and a few strays around the first row of slots.
fn default_world() -> Vec<WorldParticle> {
    [
        (10.0, 20.0),
        (-35.0, -15.0),
        (55.0, 45.0),
        (60.0, -50.0),
        (75.0, -40.0),
        (-60.0, 70.0),
        (-45.0, 80.0),
        (150.0, 30.0),
        (95.0, 110.0),
    ]
    .into_iter()
    .map(|(x, y)| WorldParticle::new(x, y))
    .collect()
}

/// Particles strictly inside the square field of view centred on `centre`.
pub fn visible_particles(
    optics: &OpticsConfig,
    particles: &[WorldParticle],
    centre: StagePosition,
    magnification: f64,
) -> Vec<WorldParticle> {
    let half = optics.fov(magnification) / 2.0;
    particles
        .iter()
        .copied()
        .filter(|p| {
            centre.x - half < p.x
                && p.x < centre.x + half
                && centre.y - half < p.y
                && p.y < centre.y + half
        })
        .collect()
}

/// Virtual SEM with a static particle world.
pub struct SimulatedMicroscope {
    optics: OpticsConfig,
    config: SimulationConfig,
    state: StageState,
    gate: ConnectionGate,
    rng: ChaCha8Rng,
    frames_acquired: u64,
}

impl SimulatedMicroscope {
    pub fn new(optics: OpticsConfig, config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            optics,
            config,
            state: StageState {
                position: StagePosition::default(),
                magnification: 500.0,
            },
            gate: ConnectionGate::default(),
            rng,
            frames_acquired: 0,
        }
    }

    /// The static world map.
    pub fn particles(&self) -> &[WorldParticle] {
        &self.config.particles
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn frames_acquired(&self) -> u64 {
        self.frames_acquired
    }

    /// Pixel position of a world particle in a frame taken at the current state.
    ///
    /// Offsets are normalised into `[0, 1)` across the field of view and then scaled
    /// by the frame size; the axis signs mirror the transform's.
    fn project(&self, particle: &WorldParticle) -> (i64, i64) {
        let fov = self.optics.fov(self.state.magnification);
        let size = f64::from(self.optics.frame_size);
        let pos = self.state.position;
        let norm_x = self.optics.axis_sign_x.factor() * (particle.x - pos.x) / fov + 0.5;
        let norm_y = self.optics.axis_sign_y.factor() * (particle.y - pos.y) / fov + 0.5;
        ((norm_x * size).floor() as i64, (norm_y * size).floor() as i64)
    }

    fn render(&mut self) -> GrayImage {
        let size = self.optics.frame_size;
        let ceiling = self.config.noise_ceiling;
        let rng = &mut self.rng;
        let mut frame = GrayImage::from_fn(size, size, |_, _| {
            if ceiling == 0 {
                Luma([0])
            } else {
                Luma([rng.gen_range(0..ceiling)])
            }
        });

        let visible = visible_particles(
            &self.optics,
            &self.config.particles,
            self.state.position,
            self.state.magnification,
        );
        for particle in &visible {
            let (cx, cy) = self.project(particle);
            draw_disc(&mut frame, cx, cy, i64::from(self.config.particle_radius));
        }

        tracing::debug!(
            x = self.state.position.x,
            y = self.state.position.y,
            magnification = self.state.magnification,
            visible = visible.len(),
            "rendered simulated frame"
        );
        frame
    }
}

fn draw_disc(frame: &mut GrayImage, cx: i64, cy: i64, radius: i64) {
    let (width, height) = frame.dimensions();
    let r2 = radius * radius;
    for dy in -radius..=radius {
        let y = cy + dy;
        if y < 0 || y >= i64::from(height) {
            continue;
        }
        for dx in -radius..=radius {
            let x = cx + dx;
            if x < 0 || x >= i64::from(width) || dx * dx + dy * dy > r2 {
                continue;
            }
            frame.put_pixel(x as u32, y as u32, Luma([PARTICLE_INTENSITY]));
        }
    }
}

#[async_trait]
impl Microscope for SimulatedMicroscope {
    fn name(&self) -> String {
        "Simulated SEM".to_string()
    }

    async fn connect(&mut self) -> AppResult<()> {
        tracing::info!(
            particles = self.config.particles.len(),
            "connected to simulated SEM"
        );
        self.gate.open();
        Ok(())
    }

    async fn set_magnification(&mut self, magnification: f64) -> AppResult<()> {
        self.gate.check("set_magnification")?;
        self.state.magnification = magnification;
        sleep(Duration::from_millis(self.config.timing.magnification_ms)).await;
        Ok(())
    }

    async fn move_stage(&mut self, position: StagePosition) -> AppResult<()> {
        self.gate.check("move_stage")?;
        self.state.position = position;
        sleep(Duration::from_millis(self.config.timing.move_ms)).await;
        Ok(())
    }

    async fn auto_focus(&mut self) -> AppResult<()> {
        self.gate.check("auto_focus")?;
        sleep(Duration::from_millis(self.config.timing.focus_ms)).await;
        Ok(())
    }

    async fn acquire_image(&mut self) -> AppResult<GrayImage> {
        self.gate.check("acquire_image")?;
        let frame = self.render();
        sleep(Duration::from_millis(self.config.timing.acquire_ms)).await;
        self.frames_acquired += 1;
        Ok(frame)
    }

    async fn stage_position(&mut self) -> AppResult<StagePosition> {
        self.gate.check("get_stage_position")?;
        Ok(self.state.position)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
