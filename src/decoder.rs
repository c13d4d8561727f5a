//! Structural and type validation of inbound telemetry payloads.
//!
//! A payload is a UTF-8 JSON object:
//!
//! ```json
//! {"timestamp":"2024-01-01T00:00:00Z","adc_value":500,"dry_value":800,"wet_value":300,"moisture_perc":60}
//! ```
//!
//! Range checks (percentage bounds, calibration bounds) are left to the store's
//! constraints; decoding is pure and never touches I/O.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::models::NewReading;

pub const TIMESTAMP: &str = "timestamp";
pub const ADC_VALUE: &str = "adc_value";
pub const DRY_VALUE: &str = "dry_value";
pub const WET_VALUE: &str = "wet_value";
pub const MOISTURE_PERC: &str = "moisture_perc";

pub const REQUIRED_FIELDS: [&str; 5] = [TIMESTAMP, ADC_VALUE, DRY_VALUE, WET_VALUE, MOISTURE_PERC];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not UTF-8, not JSON, or not a JSON object.
    #[error("malformed payload: {reason}")]
    Malformed { reason: String },

    #[error("payload is missing required fields: {}", which.join(", "))]
    MissingFields { which: Vec<&'static str> },

    #[error("field {field} has the wrong type: {reason}")]
    TypeMismatch { field: &'static str, reason: String },
}

impl DecodeError {
    /// Structural problems are expected from misbehaving publishers;
    /// type mismatches point at a firmware/format bug and get full diagnostics.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Malformed { .. } | Self::MissingFields { .. })
    }
}

/// A decoded sample, not yet bound to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadingCandidate {
    pub recorded_at: DateTime<Utc>,
    pub adc_value: i32,
    pub dry_value: i32,
    pub wet_value: i32,
    pub moisture_perc: i32,
}

impl ReadingCandidate {
    pub fn for_device(self, device_id: i32) -> NewReading {
        NewReading {
            device_id,
            recorded_at: self.recorded_at,
            adc_value: self.adc_value,
            dry_value: self.dry_value,
            wet_value: self.wet_value,
            moisture_perc: self.moisture_perc,
        }
    }
}

pub fn decode(raw: &[u8]) -> Result<ReadingCandidate, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|e| DecodeError::Malformed {
        reason: format!("not valid UTF-8: {e}"),
    })?;

    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Malformed {
        reason: format!("not valid JSON: {e}"),
    })?;

    let Value::Object(fields) = value else {
        return Err(DecodeError::Malformed {
            reason: "expected a JSON object".to_owned(),
        });
    };

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .into_iter()
        .filter(|key| !fields.contains_key(*key))
        .collect();
    if !missing.is_empty() {
        return Err(DecodeError::MissingFields { which: missing });
    }

    Ok(ReadingCandidate {
        recorded_at: timestamp_field(&fields, TIMESTAMP)?,
        adc_value: int_field(&fields, ADC_VALUE)?,
        dry_value: int_field(&fields, DRY_VALUE)?,
        wet_value: int_field(&fields, WET_VALUE)?,
        moisture_perc: int_field(&fields, MOISTURE_PERC)?,
    })
}

/// ISO-8601 forms beyond RFC 3339: space separator, basic `+HHMM` offset.
const OFFSET_FORMATS: [&str; 3] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
];
const NAIVE_SPACE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// ISO-8601 instant. Values without an offset are taken as UTC.
fn timestamp_field(
    fields: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, DecodeError> {
    let mismatch = |reason: String| DecodeError::TypeMismatch { field, reason };

    let raw = match &fields[field] {
        Value::String(s) => s.trim(),
        other => return Err(mismatch(format!("expected an ISO-8601 string, got {other}"))),
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(raw, format) {
            return Ok(ts.with_timezone(&Utc));
        }
    }
    if let Ok(naive) = raw.parse::<NaiveDateTime>() {
        return Ok(naive.and_utc());
    }
    NaiveDateTime::parse_from_str(raw, NAIVE_SPACE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| mismatch(format!("{raw:?} is not an ISO-8601 timestamp: {e}")))
}

/// Integer field. Accepts JSON integers, integral floats and decimal strings.
fn int_field(fields: &Map<String, Value>, field: &'static str) -> Result<i32, DecodeError> {
    let mismatch = |reason: String| DecodeError::TypeMismatch { field, reason };

    let wide: i64 = match &fields[field] {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() <= i64::MAX as f64 => f as i64,
                    _ => return Err(mismatch(format!("{n} is not an integer"))),
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| mismatch(format!("{s:?} is not an integer")))?,
        other => return Err(mismatch(format!("expected an integer, got {other}"))),
    };

    i32::try_from(wide).map_err(|_| mismatch(format!("{wide} does not fit in 32 bits")))
}
