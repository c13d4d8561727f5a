use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A tracked sensor, bound to exactly one broker topic.
///
/// `deactivated_at` is set exactly when `is_active` is false
/// (enforced by the `check_deactivation` constraint).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Device {
    pub id: i32,
    pub name: String,
    pub topic: String,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A known `(id, name, topic)` triple reconciled into the store at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSeed {
    pub id: i32,
    pub name: String,
    pub topic: String,
}

/// A reading accepted by the decoder and bound to a device, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReading {
    pub device_id: i32,
    pub recorded_at: DateTime<Utc>,
    pub adc_value: i32,
    pub dry_value: i32,
    pub wet_value: i32,
    pub moisture_perc: i32,
}

/// A persisted telemetry sample. Rows are append-only.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct MoistureReading {
    pub id: i64,
    pub device_id: i32,
    /// Device-local sample time.
    pub recorded_at: DateTime<Utc>,
    /// Raw ADC value; lies between `wet_value` and `dry_value`.
    pub adc_value: i32,
    /// Calibration reading in dry soil.
    pub dry_value: i32,
    /// Calibration reading in water.
    pub wet_value: i32,
    /// Derived moisture percentage, 0..=100.
    pub moisture_perc: i32,
}

/// Operator-set moisture thresholds for a device.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RecommendedRange {
    pub device_id: i32,
    pub min_perc: i32,
    pub max_perc: i32,
    pub updated_at: DateTime<Utc>,
}
