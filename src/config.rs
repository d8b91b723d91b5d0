//! Configuration using Figment
//!
//! Strongly-typed configuration for a targeting run. Values are layered:
//! 1. Built-in defaults (the stub-holder table and instrument constants)
//! 2. A TOML file, if given
//! 3. Environment variables prefixed with `SMARTSEM_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SMARTSEM_APPLICATION__LOG_LEVEL=debug
//! SMARTSEM_OPTICS__FOV_CONSTANT=180000
//! SMARTSEM_WORKFLOW__FAILURE_POLICY=isolate_slot
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! output_dir = "results"
//!
//! [optics]
//! fov_constant = 200000.0
//! frame_size = 1024
//! axis_sign_y = "negative"
//!
//! [[slots]]
//! id = 1
//! x = 10.0
//! y = 20.0
//! ```

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::detection::DetectionConfig;
use crate::error::{AppResult, SemError};
use crate::hardware::SimulationConfig;
use crate::slots::SlotCoordinateTable;
use crate::transform::OpticsConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    /// Instrument constants shared by simulator and transform
    pub optics: OpticsConfig,
    pub simulation: SimulationConfig,
    pub detection: DetectionConfig,
    pub workflow: WorkflowConfig,
    /// Slot id → world coordinate
    pub slots: SlotCoordinateTable,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Sessions are created beneath this directory
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Smart-SEM".to_string(),
            log_level: "info".to_string(),
            output_dir: PathBuf::from("results"),
        }
    }
}

/// What a hardware failure mid-run takes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole run at the first failing step.
    #[default]
    AbortRun,
    /// Abandon the failing slot and carry on with the next one.
    IsolateSlot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub failure_policy: FailurePolicy,
}

impl Settings {
    /// Defaults merged with `SMARTSEM_` environment overrides.
    pub fn load() -> AppResult<Self> {
        Self::extract(Self::base())
    }

    /// Defaults, then the TOML file at `path`, then environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SemError::Configuration(format!(
                "configuration file {} not found",
                path.display()
            )));
        }
        Self::extract(Self::base().merge(Toml::file(path)))
    }

    fn base() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment
            .merge(Env::prefixed("SMARTSEM_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid
    /// - Optics constants are positive and finite
    /// - Simulated background noise stays below the detection threshold
    /// - Slot coordinates and particle positions are finite
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SemError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.optics.fov_constant.is_finite() && self.optics.fov_constant > 0.0) {
            return Err(SemError::Configuration(format!(
                "optics.fov_constant must be positive, got {}",
                self.optics.fov_constant
            )));
        }
        if self.optics.frame_size == 0 {
            return Err(SemError::Configuration(
                "optics.frame_size must be at least 1 pixel".to_string(),
            ));
        }

        // Noise is drawn from [0, ceiling), so the brightest background pixel is ceiling - 1.
        if self.simulation.noise_ceiling > self.detection.threshold.saturating_add(1) {
            return Err(SemError::Configuration(format!(
                "simulation.noise_ceiling {} would be detected as particles (threshold {})",
                self.simulation.noise_ceiling, self.detection.threshold
            )));
        }

        for (id, position) in self.slots.iter() {
            if !(position.x.is_finite() && position.y.is_finite()) {
                return Err(SemError::Configuration(format!(
                    "slot {id} has a non-finite coordinate"
                )));
            }
        }
        if let Some(p) = self
            .simulation
            .particles
            .iter()
            .find(|p| !(p.x.is_finite() && p.y.is_finite()))
        {
            return Err(SemError::Configuration(format!(
                "simulated particle ({}, {}) is not finite",
                p.x, p.y
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.optics.fov_constant, 200_000.0);
        assert_eq!(settings.optics.frame_size, 1024);
        assert_eq!(settings.slots.len(), 20);
        assert_eq!(settings.workflow.failure_policy, FailurePolicy::AbortRun);
    }

    #[test]
    fn toml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[optics]
fov_constant = 150000.0
axis_sign_y = "negative"

[workflow]
failure_policy = "isolate_slot"

[simulation]
seed = 42
particles = [{{ x = 1.0, y = 2.0 }}]

[[slots]]
id = 4
x = -5.0
y = 7.5
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.optics.fov_constant, 150_000.0);
        assert_eq!(settings.optics.frame_size, 1024);
        assert_eq!(
            settings.optics.axis_sign_y,
            crate::transform::AxisSign::Negative
        );
        assert_eq!(settings.workflow.failure_policy, FailurePolicy::IsolateSlot);
        assert_eq!(settings.simulation.seed, Some(42));
        assert_eq!(settings.simulation.particles.len(), 1);
        assert_eq!(settings.slots.len(), 1);
        assert_eq!(
            settings.slots.get(4),
            Some(crate::transform::StagePosition::new(-5.0, 7.5))
        );
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        assert!(matches!(
            Settings::load_from("/nonexistent/smart_sem.toml"),
            Err(SemError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".into();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.optics.fov_constant = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.simulation.noise_ceiling = 250;
        assert!(settings.validate().is_err());
    }
}
