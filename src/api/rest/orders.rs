use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::scheduler::{AcceptResult, CancelResult, SubmitReceipt};
use crate::error::{DispatchError, DispatchResult};
use crate::geo::GeoPoint;
use crate::models::dispatch::{CancelInitiator, Dispatch, DispatchOffer, TerminalState};
use crate::models::order::{Order, OrderStatus, ScheduleType, VehicleFilter};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/accept", post(accept_offer))
        .route("/orders/:id/reject", post(reject_offer))
        .route("/orders/:id/cancel", post(cancel_order))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub order_id: Option<Uuid>,
    pub user_id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    #[serde(default = "one_passenger")]
    pub passenger_count: u8,
    #[serde(default)]
    pub vehicle_filter: VehicleFilter,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration_min: u32,
}

fn one_passenger() -> u8 {
    1
}

#[derive(Deserialize)]
pub struct AcceptRequest {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub driver_id: Uuid,
    pub reason_type: String,
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    #[serde(default = "passenger")]
    pub initiator: CancelInitiator,
    #[serde(default)]
    pub reason: String,
}

fn passenger() -> CancelInitiator {
    CancelInitiator::Passenger
}

#[derive(Serialize)]
pub struct OrderView {
    pub order: Order,
    pub terminal_state: TerminalState,
    pub dispatches: Vec<Dispatch>,
    pub offers: Vec<DispatchOffer>,
}

#[derive(Serialize)]
struct Ack {
    result: &'static str,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> DispatchResult<Json<SubmitReceipt>> {
    let order = Order {
        order_id: payload.order_id.unwrap_or_else(Uuid::new_v4),
        user_id: payload.user_id,
        status: OrderStatus::Requested,
        pickup: payload.pickup,
        dropoff: payload.dropoff,
        passenger_count: payload.passenger_count,
        vehicle_filter: payload.vehicle_filter,
        schedule_type: payload.schedule_type,
        scheduled_at: payload.scheduled_at,
        estimated_duration_min: payload.estimated_duration_min,
        created_at: state.engine().clock.now(),
        version: 0,
    };

    let receipt = state.dispatcher.submit(order).await?;
    Ok(Json(receipt))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> DispatchResult<Json<OrderView>> {
    let store = &state.engine().store;
    let order = store
        .get_order(id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("order {id}")))?;

    Ok(Json(OrderView {
        terminal_state: store.get_order_terminal_state(id).await?,
        dispatches: store.dispatches_for_order(id).await?,
        offers: store.offers_for_order(id).await?,
        order,
    }))
}

async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AcceptRequest>,
) -> DispatchResult<Json<AcceptResult>> {
    let result = state.dispatcher.accept(id, payload.driver_id).await?;
    Ok(Json(result))
}

async fn reject_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RejectRequest>,
) -> DispatchResult<Json<Ack>> {
    state
        .dispatcher
        .reject(id, payload.driver_id, &payload.reason_type, payload.reason)
        .await?;
    Ok(Json(Ack { result: "ok" }))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> DispatchResult<Json<CancelResult>> {
    let result = state
        .dispatcher
        .cancel(id, payload.initiator, payload.reason)
        .await?;
    Ok(Json(result))
}
