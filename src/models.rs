use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One dated reading from Withings. A group of measure rows sharing a
/// group id collapses into one of these; all fields are optional because
/// a reading may come from a scale, a blood pressure cuff, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeasurement {
    pub date: DateTime<Utc>,
    /// Weight in kg
    pub weight: Option<f64>,
    /// Body fat percentage
    pub fat_ratio: Option<f64>,
    /// Fat free mass (kg)
    pub fat_free_mass: Option<f64>,
    /// Fat mass (kg)
    pub fat_mass_weight: Option<f64>,
    /// Bone mass (kg)
    pub bone_mass: Option<f64>,
    /// Muscle mass (kg)
    pub muscle_mass: Option<f64>,
    /// Hydration percentage
    pub hydration: Option<f64>,
    /// Systolic blood pressure (mmHg)
    pub systolic: Option<f64>,
    /// Diastolic blood pressure (mmHg)
    pub diastolic: Option<f64>,
    /// Heart rate (bpm)
    pub heart_pulse: Option<f64>,
}

impl SourceMeasurement {
    pub fn empty(date: DateTime<Utc>) -> Self {
        Self {
            date,
            weight: None,
            fat_ratio: None,
            fat_free_mass: None,
            fat_mass_weight: None,
            bone_mass: None,
            muscle_mass: None,
            hydration: None,
            systolic: None,
            diastolic: None,
            heart_pulse: None,
        }
    }

    /// Whether any field worth uploading is set.
    pub fn has_data(&self) -> bool {
        self.has_body_composition() || self.has_blood_pressure() || self.heart_pulse.is_some()
    }

    /// Whether a weight_scale record can be built from this reading.
    pub fn has_body_composition(&self) -> bool {
        self.weight.is_some()
            || self.fat_ratio.is_some()
            || self.hydration.is_some()
            || self.bone_mass.is_some()
            || self.muscle_mass.is_some()
    }

    /// Whether a blood_pressure record can be built (both pressures required).
    pub fn has_blood_pressure(&self) -> bool {
        self.systolic.is_some() && self.diastolic.is_some()
    }
}

/// One raw weigh-in entry as returned by the Garmin per-day query.
/// Garmin reports grams and millisecond timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawWeighIn {
    pub weight_grams: f64,
    pub timestamp_millis: i64,
    /// Body fat percentage
    pub body_fat: Option<f64>,
    pub muscle_mass_grams: Option<f64>,
}

/// The reconciled state of one calendar day on Garmin. When a day has
/// multiple raw entries, the last one in provider order is retained and
/// `count` records how many were collapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct DayRecord {
    /// Weight in kg
    pub weight: f64,
    /// Epoch seconds of the retained entry
    pub timestamp: i64,
    pub body_fat: Option<f64>,
    /// Muscle mass in kg
    pub muscle_mass: Option<f64>,
    /// Number of raw entries collapsed into this record. > 1 signals a
    /// duplicate problem on the destination; the engine surfaces it but
    /// never deduplicates destination data.
    pub count: usize,
}

impl DayRecord {
    /// Collapse a day's raw entries, keeping the last in provider order.
    pub fn from_raw(entries: &[RawWeighIn]) -> Option<Self> {
        let last = entries.last()?;
        Some(Self {
            weight: last.weight_grams / 1000.0,
            timestamp: last.timestamp_millis / 1000,
            body_fat: last.body_fat,
            muscle_mass: last.muscle_mass_grams.map(|g| g / 1000.0),
            count: entries.len(),
        })
    }
}

/// Session-scoped map of destination day -> last known record, rebuilt on
/// demand and never persisted.
pub type Snapshot = BTreeMap<NaiveDate, DayRecord>;

/// Outcome of one upload attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub message: String,
    pub measurement_date: DateTime<Utc>,
}

impl SyncResult {
    pub fn is_skipped_duplicate(&self) -> bool {
        self.success && self.message.contains("skipped")
    }
}

/// Per-batch counts for the final summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SyncSummary {
    pub fn from_results(results: &[SyncResult]) -> Self {
        let mut summary = Self::default();
        for r in results {
            if r.is_skipped_duplicate() {
                summary.skipped += 1;
            } else if r.success {
                summary.uploaded += 1;
            } else {
                summary.failed += 1;
            }
        }
        summary
    }
}

/// Output of the diff engine: source measurements split by whether the
/// destination already holds an equivalent record for their day.
#[derive(Debug, Clone, Default)]
pub struct Classified {
    pub new: Vec<SourceMeasurement>,
    pub already_synced: Vec<SourceMeasurement>,
}
