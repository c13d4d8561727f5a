use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::OpenApi;

use super::{
    dto::{DeviceDto, RangeDto, ReadingDto},
    errors::AppError,
};
use crate::db::{Store, StoreError};

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeviceFilterParams {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct TimeRangeParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// List registered devices, optionally only the active ones.
#[utoipa::path(
    get,
    path = "/devices",
    params(
        ("active_only" = Option<bool>, Query, description = "Only return active devices"),
    ),
    responses(
        (status = 200, description = "Registered devices ordered by id", body = Vec<DeviceDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "devices"
)]
pub async fn list_devices(
    State(store): State<Store>,
    Query(params): Query<DeviceFilterParams>,
) -> Result<Json<Vec<DeviceDto>>, AppError> {
    let rows = store.query_devices(params.active_only).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Time series of one device's readings, ordered by `recorded_at ASC`.
/// Optionally bounded with `?from=<RFC3339>&to=<RFC3339>` (inclusive).
#[utoipa::path(
    get,
    path = "/devices/{device_id}/readings",
    params(
        ("device_id" = i32, Path, description = "Device id"),
        ("from" = Option<DateTime<Utc>>, Query, description = "Start of time range (RFC3339)"),
        ("to"   = Option<DateTime<Utc>>, Query, description = "End of time range (RFC3339)"),
    ),
    responses(
        (status = 200, description = "Moisture readings", body = Vec<ReadingDto>),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn get_device_readings(
    State(store): State<Store>,
    Path(device_id): Path<i32>,
    Query(params): Query<TimeRangeParams>,
) -> Result<Json<Vec<ReadingDto>>, AppError> {
    require_device(&store, device_id).await?;
    let rows = store
        .readings_for_device(device_id, params.from, params.to)
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Recommended moisture range of a device, `null` when none is set.
#[utoipa::path(
    get,
    path = "/devices/{device_id}/range",
    params(
        ("device_id" = i32, Path, description = "Device id"),
    ),
    responses(
        (status = 200, description = "Recommended range", body = Option<RangeDto>),
        (status = 404, description = "Unknown device"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "devices"
)]
pub async fn get_device_range(
    State(store): State<Store>,
    Path(device_id): Path<i32>,
) -> Result<Json<Option<RangeDto>>, AppError> {
    require_device(&store, device_id).await?;
    let row = store.get_range(device_id).await?;
    Ok(Json(row.map(Into::into)))
}

/// Latest reading of every device that has reported at least once.
#[utoipa::path(
    get,
    path = "/readings/latest",
    responses(
        (status = 200, description = "Latest reading per device", body = Vec<ReadingDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "readings"
)]
pub async fn get_latest_readings(
    State(store): State<Store>,
) -> Result<Json<Vec<ReadingDto>>, AppError> {
    let rows = store.latest_readings().await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn require_device(store: &Store, device_id: i32) -> Result<(), AppError> {
    match store.get_device(device_id).await {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound) => Err(AppError::NotFound(format!(
            "device {device_id} does not exist"
        ))),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(list_devices, get_device_readings, get_device_range, get_latest_readings, health),
    components(schemas(DeviceDto, ReadingDto, RangeDto)),
    tags(
        (name = "devices",  description = "Registered soil moisture sensors"),
        (name = "readings", description = "Ingested moisture readings"),
        (name = "system",   description = "System endpoints"),
    ),
    info(
        title = "Plant Moisture Dashboard API",
        version = "0.1.0",
        description = "Read-only access to ingested soil moisture telemetry"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
