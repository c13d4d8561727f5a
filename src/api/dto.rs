use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{Device, MoistureReading, RecommendedRange};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeviceDto {
    pub id: i32,
    pub name: String,
    /// Broker topic, `plant-monitoring/<location>/<name>/telemetry`.
    pub topic: String,
    pub is_active: bool,
    /// Set while the device is inactive.
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadingDto {
    pub device_id: i32,
    /// Device-local sample time (RFC3339).
    pub recorded_at: DateTime<Utc>,
    pub adc_value: i32,
    pub dry_value: i32,
    pub wet_value: i32,
    /// Moisture percentage, 0..=100.
    pub moisture_perc: i32,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RangeDto {
    pub device_id: i32,
    pub min_perc: i32,
    pub max_perc: i32,
    pub updated_at: DateTime<Utc>,
}

impl From<Device> for DeviceDto {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            name: d.name,
            topic: d.topic,
            is_active: d.is_active,
            deactivated_at: d.deactivated_at,
        }
    }
}

impl From<MoistureReading> for ReadingDto {
    fn from(r: MoistureReading) -> Self {
        Self {
            device_id: r.device_id,
            recorded_at: r.recorded_at,
            adc_value: r.adc_value,
            dry_value: r.dry_value,
            wet_value: r.wet_value,
            moisture_perc: r.moisture_perc,
        }
    }
}

impl From<RecommendedRange> for RangeDto {
    fn from(r: RecommendedRange) -> Self {
        Self {
            device_id: r.device_id,
            min_perc: r.min_perc,
            max_perc: r.max_perc,
            updated_at: r.updated_at,
        }
    }
}
