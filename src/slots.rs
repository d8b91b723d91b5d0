//! Sample slots: where they are, and what to do at each.
//!
//! [`SlotCoordinateTable`] is the fixed stub-holder map (slot id → world coordinate).
//! [`ActiveSlots`] is the per-run input: which slots to image, under what sample name,
//! and with which magnification settings. Its iteration order is the order the slots
//! were supplied in.

use std::collections::BTreeMap;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, SemError};
use crate::transform::StagePosition;

/// One entry of the coordinate table in its configuration-file form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotCoordinate {
    pub id: u32,
    pub x: f64,
    pub y: f64,
}

/// Fixed mapping from slot id to the world coordinate of its centre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<SlotCoordinate>", into = "Vec<SlotCoordinate>")]
pub struct SlotCoordinateTable {
    entries: BTreeMap<u32, StagePosition>,
}

impl From<Vec<SlotCoordinate>> for SlotCoordinateTable {
    fn from(list: Vec<SlotCoordinate>) -> Self {
        Self {
            entries: list
                .into_iter()
                .map(|c| (c.id, StagePosition::new(c.x, c.y)))
                .collect(),
        }
    }
}

impl From<SlotCoordinateTable> for Vec<SlotCoordinate> {
    fn from(table: SlotCoordinateTable) -> Self {
        table
            .entries
            .into_iter()
            .map(|(id, p)| SlotCoordinate { id, x: p.x, y: p.y })
            .collect()
    }
}

impl Default for SlotCoordinateTable {
    /// The 20-position stub holder: two rows of ten, 10 units apart in x.
    fn default() -> Self {
        (1..=20u32)
            .map(|id| SlotCoordinate {
                id,
                x: 10.0 * f64::from((id - 1) % 10 + 1),
                y: 20.0 * f64::from(1 + (id - 1) / 10),
            })
            .collect::<Vec<_>>()
            .into()
    }
}

impl SlotCoordinateTable {
    pub fn get(&self, slot_id: u32) -> Option<StagePosition> {
        self.entries.get(&slot_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, StagePosition)> + '_ {
        self.entries.iter().map(|(id, p)| (*id, *p))
    }
}

/// Magnification settings for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSettings {
    pub low_mag: f64,
    pub high_mag: f64,
    /// Third stage magnification; `0` disables it.
    #[serde(default)]
    pub high_mag_2: f64,
    /// Maximum number of particles re-imaged per slot.
    pub high_count: usize,
}

/// Whether the super-high-magnification stage runs for a slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageTwo {
    /// `high_mag_2` is zero.
    Disabled,
    Enabled(f64),
    /// `high_mag_2` is set but does not exceed `high_mag`.
    Rejected(f64),
}

impl SlotSettings {
    /// Checks the settings a slot cannot run without.
    pub fn validate(&self) -> AppResult<()> {
        for (field, value) in [("low_mag", self.low_mag), ("high_mag", self.high_mag)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SemError::Configuration(format!(
                    "{field} must be a positive number, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Stage 2 runs only for a finite `high_mag_2` above `high_mag`. Any other
    /// non-zero value (negative, NaN, not larger) disables it but never the slot.
    pub fn stage_two(&self) -> StageTwo {
        if self.high_mag_2 == 0.0 {
            StageTwo::Disabled
        } else if self.high_mag_2.is_finite() && self.high_mag_2 > self.high_mag {
            StageTwo::Enabled(self.high_mag_2)
        } else {
            StageTwo::Rejected(self.high_mag_2)
        }
    }
}

/// A slot as supplied by the configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub name: String,
    pub settings: SlotSettings,
}

/// One resolved item of [`ActiveSlots`].
#[derive(Debug, Clone, PartialEq)]
pub struct SlotConfiguration {
    pub slot_id: u32,
    pub sample_name: String,
    pub settings: SlotSettings,
}

/// The slots selected for a run, in the order they were supplied.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "IndexMap<String, SlotEntry>")]
pub struct ActiveSlots {
    slots: IndexMap<u32, SlotEntry>,
}

impl TryFrom<IndexMap<String, SlotEntry>> for ActiveSlots {
    type Error = SemError;

    fn try_from(raw: IndexMap<String, SlotEntry>) -> Result<Self, Self::Error> {
        let mut slots = IndexMap::with_capacity(raw.len());
        for (key, entry) in raw {
            let id: u32 = key.trim().parse().map_err(|_| {
                SemError::Configuration(format!("slot id '{key}' is not a positive integer"))
            })?;
            if id == 0 {
                return Err(SemError::Configuration(
                    "slot ids start at 1".to_string(),
                ));
            }
            slots.insert(id, entry);
        }
        Ok(Self { slots })
    }
}

impl ActiveSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a slot; a new id goes to the end of the run order.
    pub fn insert(&mut self, slot_id: u32, name: impl Into<String>, settings: SlotSettings) {
        self.slots.insert(
            slot_id,
            SlotEntry {
                name: name.into(),
                settings,
            },
        );
    }

    pub fn with_slot(mut self, slot_id: u32, name: impl Into<String>, settings: SlotSettings) -> Self {
        self.insert(slot_id, name, settings);
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SlotConfiguration> + '_ {
        self.slots.iter().map(|(id, entry)| SlotConfiguration {
            slot_id: *id,
            sample_name: entry.name.clone(),
            settings: entry.settings.clone(),
        })
    }

    pub fn from_json_str(text: &str) -> AppResult<Self> {
        serde_json::from_str(text).map_err(|e| SemError::Configuration(e.to_string()))
    }

    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        toml::from_str(text).map_err(|e| SemError::Configuration(e.to_string()))
    }

    /// Load from a `.json` or `.toml` file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("toml") => Self::from_toml_str(&text),
            other => Err(SemError::Configuration(format!(
                "unsupported slot file extension {other:?} for {}",
                path.display()
            ))),
        }
    }

    /// The single-sample run used when no slot file is given.
    pub fn cli_default() -> Self {
        Self::new().with_slot(
            1,
            "CLI_Test_Sample",
            SlotSettings {
                low_mag: 1000.0,
                high_mag: 5000.0,
                high_mag_2: 0.0,
                high_count: 3,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(high_mag: f64, high_mag_2: f64) -> SlotSettings {
        SlotSettings {
            low_mag: 1000.0,
            high_mag,
            high_mag_2,
            high_count: 2,
        }
    }

    #[test]
    fn default_table_matches_stub_holder() {
        let table = SlotCoordinateTable::default();
        assert_eq!(table.len(), 20);
        assert_eq!(table.get(1), Some(StagePosition::new(10.0, 20.0)));
        assert_eq!(table.get(10), Some(StagePosition::new(100.0, 20.0)));
        assert_eq!(table.get(11), Some(StagePosition::new(10.0, 40.0)));
        assert_eq!(table.get(20), Some(StagePosition::new(100.0, 40.0)));
        assert_eq!(table.get(21), None);
    }

    #[test]
    fn stage_two_requires_strictly_higher_magnification() {
        assert_eq!(settings(5000.0, 0.0).stage_two(), StageTwo::Disabled);
        assert_eq!(settings(5000.0, 50_000.0).stage_two(), StageTwo::Enabled(50_000.0));
        assert_eq!(settings(50_000.0, 50_000.0).stage_two(), StageTwo::Rejected(50_000.0));
        assert_eq!(settings(50_000.0, 20_000.0).stage_two(), StageTwo::Rejected(20_000.0));
        assert_eq!(settings(5000.0, -1.0).stage_two(), StageTwo::Rejected(-1.0));
        assert!(matches!(
            settings(5000.0, f64::NAN).stage_two(),
            StageTwo::Rejected(m) if m.is_nan()
        ));
        assert!(matches!(
            settings(5000.0, f64::INFINITY).stage_two(),
            StageTwo::Rejected(_)
        ));
    }

    #[test]
    fn validate_rejects_non_positive_magnification() {
        assert!(settings(5000.0, 0.0).validate().is_ok());
        assert!(settings(0.0, 0.0).validate().is_err());
        assert!(settings(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn bad_stage_two_value_does_not_invalidate_slot() {
        assert!(settings(5000.0, -1.0).validate().is_ok());
        assert!(settings(5000.0, f64::NAN).validate().is_ok());
    }

    #[test]
    fn json_preserves_supplied_order() {
        let text = r#"{
            "7": {"name": "B", "settings": {"low_mag": 1000, "high_count": 1, "high_mag": 5000}},
            "3": {"name": "A", "settings": {"low_mag": 800, "high_count": 2, "high_mag": 4000, "high_mag_2": 9000}}
        }"#;
        let slots = ActiveSlots::from_json_str(text).unwrap();
        let ids: Vec<u32> = slots.iter().map(|s| s.slot_id).collect();
        assert_eq!(ids, vec![7, 3]);

        let second = slots.iter().nth(1).unwrap();
        assert_eq!(second.sample_name, "A");
        assert_eq!(second.settings.high_mag_2, 9000.0);
        assert_eq!(slots.iter().next().unwrap().settings.high_mag_2, 0.0);
    }

    #[test]
    fn toml_slots_parse() {
        let text = r#"
            [5]
            name = "NCM_05"
            settings = { low_mag = 1000.0, high_mag = 20000.0, high_mag_2 = 50000.0, high_count = 5 }

            [2]
            name = "NCM_02"
            settings = { low_mag = 1000.0, high_mag = 20000.0, high_count = 1 }
        "#;
        let slots = ActiveSlots::from_toml_str(text).unwrap();
        let ids: Vec<u32> = slots.iter().map(|s| s.slot_id).collect();
        assert_eq!(ids, vec![5, 2]);
    }

    #[test]
    fn non_numeric_slot_ids_are_rejected() {
        let text = r#"{"first": {"name": "X", "settings": {"low_mag": 1, "high_count": 1, "high_mag": 2}}}"#;
        assert!(matches!(
            ActiveSlots::from_json_str(text),
            Err(SemError::Configuration(_))
        ));
        let zero = r#"{"0": {"name": "X", "settings": {"low_mag": 1, "high_count": 1, "high_mag": 2}}}"#;
        assert!(ActiveSlots::from_json_str(zero).is_err());
    }
}
