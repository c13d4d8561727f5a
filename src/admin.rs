//! Operator actions behind `plantctl`. Inputs are validated here, before any
//! store round trip; the store constraints remain the last line of defence.

use thiserror::Error;
use tracing::info;

use crate::{
    db::{
        models::{Device, RecommendedRange},
        Store, StoreError,
    },
    topic::{DeviceTopic, TopicError},
};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("device name must not be empty")]
    EmptyName,

    #[error(transparent)]
    InvalidTopic(#[from] TopicError),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("device {0} does not exist")]
    UnknownDevice(i32),

    #[error("duplicate: a device with this name or topic already exists ({constraint})")]
    Duplicate { constraint: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A device about to be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDevice {
    pub name: String,
    pub topic: DeviceTopic,
}

impl NewDevice {
    pub fn new(name: &str, location: &str, topic_name: &str) -> Result<Self, AdminError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AdminError::EmptyName);
        }
        Ok(Self {
            name: name.to_owned(),
            topic: DeviceTopic::new(location, topic_name)?,
        })
    }
}

pub async fn add_device(store: &Store, device: &NewDevice) -> Result<Device, AdminError> {
    let topic = device.topic.to_string();
    match store.insert_device(&device.name, &topic).await {
        Ok(row) => {
            info!(device_id = row.id, name = %row.name, topic = %row.topic, "Device added");
            Ok(row)
        }
        Err(StoreError::IntegrityConflict { constraint }) => Err(AdminError::Duplicate { constraint }),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Changed(Device),
    /// The device already had the requested status.
    Unchanged(Device),
}

pub async fn set_status(store: &Store, device_id: i32, active: bool) -> Result<StatusChange, AdminError> {
    let current = get_device(store, device_id).await?;
    if current.is_active == active {
        return Ok(StatusChange::Unchanged(current));
    }

    let updated = store
        .set_device_active(device_id, active)
        .await
        .map_err(|e| not_found_as_unknown(e, device_id))?;
    info!(device_id, active, "Device status changed");
    Ok(StatusChange::Changed(updated))
}

pub async fn get_device(store: &Store, device_id: i32) -> Result<Device, AdminError> {
    store
        .get_device(device_id)
        .await
        .map_err(|e| not_found_as_unknown(e, device_id))
}

/// Moisture thresholds in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub min_perc: i32,
    pub max_perc: i32,
}

impl RangeRequest {
    pub fn new(min_perc: i32, max_perc: i32) -> Result<Self, AdminError> {
        for (label, value) in [("minimum", min_perc), ("maximum", max_perc)] {
            if !(0..=100).contains(&value) {
                return Err(AdminError::InvalidRange(format!(
                    "{label} {value} is outside 0..=100"
                )));
            }
        }
        if max_perc <= min_perc {
            return Err(AdminError::InvalidRange(format!(
                "maximum {max_perc} must be greater than minimum {min_perc}"
            )));
        }
        Ok(Self { min_perc, max_perc })
    }
}

pub async fn set_range(
    store: &Store,
    device_id: i32,
    range: RangeRequest,
) -> Result<RecommendedRange, AdminError> {
    match store.upsert_range(device_id, range.min_perc, range.max_perc).await {
        Ok(row) => {
            info!(device_id, min = row.min_perc, max = row.max_perc, "Recommended range set");
            Ok(row)
        }
        Err(StoreError::ForeignKey { .. }) => Err(AdminError::UnknownDevice(device_id)),
        Err(e) => Err(e.into()),
    }
}

fn not_found_as_unknown(err: StoreError, device_id: i32) -> AdminError {
    match err {
        StoreError::NotFound => AdminError::UnknownDevice(device_id),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    async fn device_count(pool: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn new_device_builds_topic() {
        let d = NewDevice::new(" Scarlet Star ", "living-room", "scarlet-star-1").unwrap();
        assert_eq!(d.name, "Scarlet Star");
        assert_eq!(
            d.topic.to_string(),
            "plant-monitoring/living-room/scarlet-star-1/telemetry"
        );
    }

    #[test]
    fn new_device_rejects_bad_input() {
        assert!(matches!(NewDevice::new("  ", "a", "b"), Err(AdminError::EmptyName)));
        assert!(matches!(
            NewDevice::new("basil", "kitchen/shelf", "basil"),
            Err(AdminError::InvalidTopic(_))
        ));
    }

    #[test]
    fn range_validation() {
        assert_eq!(
            RangeRequest::new(20, 60).unwrap(),
            RangeRequest { min_perc: 20, max_perc: 60 }
        );
        assert!(RangeRequest::new(0, 100).is_ok());
        for (min, max) in [(60, 20), (50, 50), (-1, 50), (10, 101)] {
            assert!(
                matches!(RangeRequest::new(min, max), Err(AdminError::InvalidRange(_))),
                "({min}, {max}) should be rejected"
            );
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn add_device_then_duplicate(pool: PgPool) {
        let store = Store::new(pool.clone());
        let device = NewDevice::new("basil", "kitchen", "basil").unwrap();

        let row = add_device(&store, &device).await.unwrap();
        assert_eq!(row.topic, "plant-monitoring/kitchen/basil/telemetry");

        let err = add_device(&store, &device).await.unwrap_err();
        assert!(matches!(err, AdminError::Duplicate { .. }), "unexpected error: {err:?}");
        assert!(err.to_string().starts_with("duplicate"));
        assert_eq!(device_count(&pool).await, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn invalid_topic_never_reaches_store(pool: PgPool) {
        assert!(NewDevice::new("basil", "kitchen", "basil/telemetry").is_err());
        assert_eq!(device_count(&pool).await, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn set_status_reports_unchanged_and_changed(pool: PgPool) {
        let store = Store::new(pool);
        let row = add_device(&store, &NewDevice::new("basil", "kitchen", "basil").unwrap())
            .await
            .unwrap();

        assert!(matches!(
            set_status(&store, row.id, true).await.unwrap(),
            StatusChange::Unchanged(_)
        ));

        match set_status(&store, row.id, false).await.unwrap() {
            StatusChange::Changed(d) => {
                assert!(!d.is_active);
                assert!(d.deactivated_at.is_some());
            }
            other => panic!("unexpected change: {other:?}"),
        }

        assert!(matches!(
            set_status(&store, 999, false).await,
            Err(AdminError::UnknownDevice(999))
        ));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn set_range_for_unknown_device(pool: PgPool) {
        let store = Store::new(pool);
        let err = set_range(&store, 42, RangeRequest::new(20, 60).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::UnknownDevice(42)));
    }
}
