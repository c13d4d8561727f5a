pub mod error;
pub mod models;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use tracing::info;

use crate::config::DatabaseConfig;

pub use self::error::{StoreError, StoreResult};
use self::models::{Device, DeviceSeed, MoistureReading, NewReading, RecommendedRange};

const DEVICE_COLUMNS: &str = "id, name, topic, is_active, deactivated_at, created_at";
const READING_COLUMNS: &str =
    "id, device_id, recorded_at, adc_value, dry_value, wet_value, moisture_perc";

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(config.connect_options()?)
        .await
        .context("failed to connect to postgres")?;
    Ok(pool)
}

/// Persistence gateway over the shared connection pool.
///
/// Every write runs in its own transaction. A `Transaction` dropped before
/// `commit` rolls back, so an early `?` return never leaves a partial write.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create all tables and constraints if they do not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        info!("Creating schema if it does not exist");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Schema ready");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Readings
    // -----------------------------------------------------------------------

    /// Insert one reading. CHECK failures surface as `ConstraintViolation`.
    pub async fn insert_reading(&self, reading: &NewReading) -> StoreResult<MoistureReading> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, MoistureReading>(&format!(
            "INSERT INTO moisture_readings \
                 (device_id, recorded_at, adc_value, dry_value, wet_value, moisture_perc) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {READING_COLUMNS}"
        ))
        .bind(reading.device_id)
        .bind(reading.recorded_at)
        .bind(reading.adc_value)
        .bind(reading.dry_value)
        .bind(reading.wet_value)
        .bind(reading.moisture_perc)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Readings for one device in ascending time order, optionally bounded (inclusive).
    pub async fn readings_for_device(
        &self,
        device_id: i32,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<MoistureReading>> {
        let rows = sqlx::query_as::<_, MoistureReading>(&format!(
            "SELECT {READING_COLUMNS} \
             FROM moisture_readings \
             WHERE device_id = $1 \
               AND ($2::timestamptz IS NULL OR recorded_at >= $2) \
               AND ($3::timestamptz IS NULL OR recorded_at <= $3) \
             ORDER BY recorded_at ASC, id ASC"
        ))
        .bind(device_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// The most recent reading of every device that has one.
    pub async fn latest_readings(&self) -> StoreResult<Vec<MoistureReading>> {
        let rows = sqlx::query_as::<_, MoistureReading>(&format!(
            "SELECT DISTINCT ON (device_id) {READING_COLUMNS} \
             FROM moisture_readings \
             ORDER BY device_id, recorded_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    pub async fn query_devices(&self, active_only: bool) -> StoreResult<Vec<Device>> {
        let rows = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE ($1 = FALSE OR is_active) \
             ORDER BY id"
        ))
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_device(&self, id: i32) -> StoreResult<Device> {
        let row = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or(StoreError::NotFound)
    }

    /// Insert a new active device; the id comes from the identity sequence.
    pub async fn insert_device(&self, name: &str, topic: &str) -> StoreResult<Device> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, Device>(&format!(
            "INSERT INTO devices (name, topic) VALUES ($1, $2) RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(name)
        .bind(topic)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Toggle the active flag. Deactivating stamps `deactivated_at`, activating clears it.
    pub async fn set_device_active(&self, id: i32, active: bool) -> StoreResult<Device> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, Device>(&format!(
            "UPDATE devices \
             SET is_active = $2, \
                 deactivated_at = CASE WHEN $2 THEN NULL ELSE now() END \
             WHERE id = $1 \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(active)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;
        tx.commit().await?;
        Ok(row)
    }

    /// Insert seed devices, skipping rows whose `(id, name)` already exist.
    ///
    /// An id that exists under a different name, or a topic owned by another
    /// device, is not suppressed: it fails with `IntegrityConflict` and nothing
    /// from the batch is written. Returns the number of rows inserted.
    pub async fn upsert_device_seed(&self, seeds: &[DeviceSeed]) -> StoreResult<u64> {
        if seeds.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let mut insert = QueryBuilder::<Postgres>::new("INSERT INTO devices (id, name, topic) ");
        insert.push_values(seeds, |mut row, seed| {
            row.push_bind(seed.id)
                .push_bind(&seed.name)
                .push_bind(&seed.topic);
        });
        insert.push(" ON CONFLICT (id, name) DO NOTHING");
        let inserted = insert.build().execute(&mut *tx).await?.rows_affected();

        // Explicit ids bypass the identity sequence; move it past them.
        sqlx::query(
            "SELECT setval(pg_get_serial_sequence('devices', 'id'), \
                           GREATEST((SELECT MAX(id) FROM devices), 1))",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    // -----------------------------------------------------------------------
    // Recommended ranges
    // -----------------------------------------------------------------------

    /// Set the thresholds for a device, replacing any previous submission.
    pub async fn upsert_range(
        &self,
        device_id: i32,
        min_perc: i32,
        max_perc: i32,
    ) -> StoreResult<RecommendedRange> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, RecommendedRange>(
            "INSERT INTO recommended_ranges (device_id, min_perc, max_perc, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (device_id) DO UPDATE \
                 SET min_perc = EXCLUDED.min_perc, \
                     max_perc = EXCLUDED.max_perc, \
                     updated_at = EXCLUDED.updated_at \
             RETURNING device_id, min_perc, max_perc, updated_at",
        )
        .bind(device_id)
        .bind(min_perc)
        .bind(max_perc)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn get_range(&self, device_id: i32) -> StoreResult<Option<RecommendedRange>> {
        let row = sqlx::query_as::<_, RecommendedRange>(
            "SELECT device_id, min_perc, max_perc, updated_at \
             FROM recommended_ranges WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use sqlx::PgPool;

    use super::*;

    const TOPIC: &str = "plant-monitoring/living-room/scarlet-star-1/telemetry";

    fn seed(id: i32, name: &str, topic: &str) -> DeviceSeed {
        DeviceSeed {
            id,
            name: name.to_owned(),
            topic: topic.to_owned(),
        }
    }

    fn reading(device_id: i32, adc: i32, perc: i32) -> NewReading {
        NewReading {
            device_id,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            adc_value: adc,
            dry_value: 800,
            wet_value: 300,
            moisture_perc: perc,
        }
    }

    async fn reading_count(pool: &PgPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM moisture_readings")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn store_with_device(pool: PgPool) -> Store {
        let store = Store::new(pool);
        store
            .upsert_device_seed(&[seed(1, "scarlet-star-1", TOPIC)])
            .await
            .unwrap();
        store
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn ensure_schema_is_idempotent(pool: PgPool) {
        let store = Store::new(pool);
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn inserted_reading_reads_back(pool: PgPool) {
        let store = store_with_device(pool).await;
        let new = reading(1, 500, 60);
        let inserted = store.insert_reading(&new).await.unwrap();

        let rows = store.readings_for_device(1, None, None).await.unwrap();
        assert_eq!(rows, vec![inserted.clone()]);
        assert_eq!(inserted.recorded_at, new.recorded_at);
        assert_eq!(inserted.adc_value, 500);
        assert_eq!(inserted.dry_value, 800);
        assert_eq!(inserted.wet_value, 300);
        assert_eq!(inserted.moisture_perc, 60);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn percentage_out_of_range_is_rejected(pool: PgPool) {
        let store = store_with_device(pool.clone()).await;
        let err = store.insert_reading(&reading(1, 500, 150)).await.unwrap_err();
        assert!(
            matches!(&err, StoreError::ConstraintViolation { constraint } if constraint == "check_moisture_perc_range"),
            "unexpected error: {err:?}"
        );
        assert_eq!(reading_count(&pool).await, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn adc_outside_calibration_is_rejected(pool: PgPool) {
        let store = store_with_device(pool.clone()).await;
        for adc in [299, 801] {
            let err = store.insert_reading(&reading(1, adc, 50)).await.unwrap_err();
            assert!(
                matches!(&err, StoreError::ConstraintViolation { constraint } if constraint == "check_adc_value_range"),
                "unexpected error: {err:?}"
            );
        }
        assert_eq!(reading_count(&pool).await, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn reading_for_unknown_device_is_rejected(pool: PgPool) {
        let store = Store::new(pool.clone());
        let err = store.insert_reading(&reading(42, 500, 60)).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKey { .. }), "unexpected error: {err:?}");
        assert_eq!(reading_count(&pool).await, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn seeding_twice_keeps_one_row(pool: PgPool) {
        let store = Store::new(pool);
        let seeds = [seed(1, "scarlet-star-1", TOPIC)];
        assert_eq!(store.upsert_device_seed(&seeds).await.unwrap(), 1);
        assert_eq!(store.upsert_device_seed(&seeds).await.unwrap(), 0);

        let devices = store.query_devices(false).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, 1);
        assert_eq!(devices[0].name, "scarlet-star-1");
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn seeding_same_id_with_other_name_conflicts(pool: PgPool) {
        let store = Store::new(pool);
        store.upsert_device_seed(&[seed(1, "scarlet-star-1", TOPIC)]).await.unwrap();

        let err = store
            .upsert_device_seed(&[seed(
                1,
                "basil",
                "plant-monitoring/kitchen/basil/telemetry",
            )])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IntegrityConflict { .. }), "unexpected error: {err:?}");

        let device = store.get_device(1).await.unwrap();
        assert_eq!(device.name, "scarlet-star-1");
        assert_eq!(device.topic, TOPIC);
        assert_eq!(store.query_devices(false).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn device_inserted_after_seed_gets_fresh_id(pool: PgPool) {
        let store = Store::new(pool);
        store.upsert_device_seed(&[seed(5, "scarlet-star-1", TOPIC)]).await.unwrap();

        let device = store
            .insert_device("basil", "plant-monitoring/kitchen/basil/telemetry")
            .await
            .unwrap();
        assert!(device.id > 5);
        assert!(device.is_active);
        assert!(device.deactivated_at.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn duplicate_device_name_or_topic_conflicts(pool: PgPool) {
        let store = Store::new(pool);
        store.insert_device("scarlet-star-1", TOPIC).await.unwrap();

        let err = store
            .insert_device("scarlet-star-1", "plant-monitoring/kitchen/basil/telemetry")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IntegrityConflict { .. }));

        let err = store.insert_device("basil", TOPIC).await.unwrap_err();
        assert!(matches!(err, StoreError::IntegrityConflict { .. }));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn malformed_topic_is_rejected_by_store(pool: PgPool) {
        let store = Store::new(pool);
        let err = store.insert_device("basil", "unknown/topic").await.unwrap_err();
        assert!(
            matches!(&err, StoreError::ConstraintViolation { constraint } if constraint == "check_topic"),
            "unexpected error: {err:?}"
        );
        assert!(store.query_devices(false).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn topic_cannot_be_rewritten(pool: PgPool) {
        let store = store_with_device(pool.clone()).await;
        let err: StoreError = sqlx::query("UPDATE devices SET topic = $1 WHERE id = 1")
            .bind("plant-monitoring/kitchen/basil/telemetry")
            .execute(&pool)
            .await
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }), "unexpected error: {err:?}");
        assert_eq!(store.get_device(1).await.unwrap().topic, TOPIC);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn deactivation_sets_and_clears_timestamp(pool: PgPool) {
        let store = store_with_device(pool).await;

        let off = store.set_device_active(1, false).await.unwrap();
        assert!(!off.is_active);
        assert!(off.deactivated_at.is_some());
        assert!(store.query_devices(true).await.unwrap().is_empty());

        let on = store.set_device_active(1, true).await.unwrap();
        assert!(on.is_active);
        assert!(on.deactivated_at.is_none());
        assert_eq!(store.query_devices(true).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn set_active_on_unknown_device_is_not_found(pool: PgPool) {
        let store = Store::new(pool);
        let err = store.set_device_active(9, false).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn range_upsert_replaces_previous(pool: PgPool) {
        let store = store_with_device(pool).await;
        assert!(store.get_range(1).await.unwrap().is_none());

        store.upsert_range(1, 20, 60).await.unwrap();
        let updated = store.upsert_range(1, 30, 70).await.unwrap();
        assert_eq!((updated.min_perc, updated.max_perc), (30, 70));
        assert_eq!(store.get_range(1).await.unwrap(), Some(updated));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn inverted_range_is_rejected(pool: PgPool) {
        let store = store_with_device(pool).await;
        let err = store.upsert_range(1, 70, 30).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation { .. }));
        assert!(store.get_range(1).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn latest_readings_picks_newest_per_device(pool: PgPool) {
        let store = store_with_device(pool).await;
        let mut older = reading(1, 500, 60);
        older.recorded_at = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        store.insert_reading(&older).await.unwrap();
        store.insert_reading(&reading(1, 600, 40)).await.unwrap();

        let latest = store.latest_readings().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].adc_value, 600);
    }
}
