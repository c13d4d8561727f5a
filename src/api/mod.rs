pub mod dto;
pub mod errors;
pub mod handlers;

use axum::{routing::get, Router};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;

use crate::db::Store;
use handlers::ApiDoc;

/// Read-only dashboard API over the store.
pub fn router(store: Store) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .route("/devices", get(handlers::list_devices))
        .route("/devices/{device_id}/readings", get(handlers::get_device_readings))
        .route("/devices/{device_id}/range", get(handlers::get_device_range))
        .route("/readings/latest", get(handlers::get_latest_readings))
        .with_state(store)
        .split_for_parts();

    router
        .route("/health", get(handlers::health))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { axum::Json(api) }),
        )
}
