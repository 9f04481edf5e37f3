use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, DispatchResult};
use crate::geo::GeoPoint;
use crate::models::driver::{DriverProfile, DriverRuntime, LocationUpdate, OnlineStatus};
use crate::runtime::LocationOutcome;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id", get(get_driver))
        .route("/drivers/:id/location", patch(update_driver_location))
        .route("/drivers/:id/status", patch(update_driver_status))
        .route("/drivers/:id/heartbeat", post(heartbeat))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub driver_id: Option<Uuid>,
    pub location: GeoPoint,
    pub vehicle_id: String,
    pub vehicle_category: String,
    #[serde(default)]
    pub vehicle_level: u8,
    pub rating: f64,
    pub acceptance_rate: f64,
    #[serde(default)]
    pub experience_level: u32,
    #[serde(default)]
    pub max_queue_capacity: u32,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub accuracy: f64,
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OnlineStatus,
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub ts: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct LocationResponse {
    pub result: LocationOutcome,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub driver_id: Uuid,
    pub status: OnlineStatus,
    pub version: u64,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> DispatchResult<Json<DriverRuntime>> {
    if payload.vehicle_id.trim().is_empty() {
        return Err(DispatchError::invalid("vehicle_id cannot be empty"));
    }
    if !(0.0..=5.0).contains(&payload.rating) {
        return Err(DispatchError::invalid("rating must be within 0..=5"));
    }
    if !(0.0..=1.0).contains(&payload.acceptance_rate) {
        return Err(DispatchError::invalid("acceptance_rate must be within 0..=1"));
    }

    let engine = state.engine();
    let runtime = engine.runtime.register(DriverProfile {
        driver_id: payload.driver_id.unwrap_or_else(Uuid::new_v4),
        location: payload.location,
        vehicle_id: payload.vehicle_id,
        vehicle_category: payload.vehicle_category,
        vehicle_level: payload.vehicle_level,
        rating: payload.rating,
        acceptance_rate: payload.acceptance_rate,
        experience_level: payload.experience_level,
        max_queue_capacity: payload.max_queue_capacity,
    })?;
    refresh_online_gauge(&state);

    Ok(Json(runtime))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<DriverRuntime>> {
    Json(state.engine().runtime.list())
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> DispatchResult<Json<DriverRuntime>> {
    let runtime = state
        .engine()
        .runtime
        .get(id)
        .ok_or_else(|| DispatchError::NotFound(format!("driver {id}")))?;
    Ok(Json(runtime))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> DispatchResult<Json<LocationResponse>> {
    let engine = state.engine();
    let result = engine.runtime.upsert_location(
        id,
        LocationUpdate {
            lat: payload.lat,
            lng: payload.lng,
            heading: payload.heading,
            speed: payload.speed,
            accuracy: payload.accuracy,
            ts: payload.ts.unwrap_or_else(|| engine.clock.now()),
        },
    )?;
    Ok(Json(LocationResponse { result }))
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> DispatchResult<Json<StatusResponse>> {
    let engine = state.engine();
    let ts = payload.ts.unwrap_or_else(|| engine.clock.now());
    let version = engine.runtime.set_status(id, payload.status, ts)?;
    refresh_online_gauge(&state);

    Ok(Json(StatusResponse {
        driver_id: id,
        status: payload.status,
        version,
    }))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<HeartbeatRequest>,
) -> DispatchResult<Json<serde_json::Value>> {
    let engine = state.engine();
    let ts = payload.ts.unwrap_or_else(|| engine.clock.now());
    engine.runtime.heartbeat(id, ts)?;
    Ok(Json(serde_json::json!({ "result": "ok" })))
}

fn refresh_online_gauge(state: &AppState) {
    let engine = state.engine();
    engine
        .metrics
        .drivers_online
        .set(engine.runtime.online_count() as i64);
}
