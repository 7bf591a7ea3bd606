use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::pool::PoolEntry;
use crate::engine::settlement::PaymentDeclaration;
use crate::engine::tracker::SampleOutcome;
use crate::engine::transitions::{Actor, Transition};
use crate::error::AppError;
use crate::geo;
use crate::models::courier::{Courier, GeoPoint, PositionSample, VehicleType};
use crate::models::order::{Amount, DeliveryOrder, PaymentMethod};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/:id/deliveries", get(active_deliveries))
        .route("/delivery/pending-pickup", get(pending_pickup))
        .route("/delivery/:id/pickup", post(pickup))
        .route("/delivery/:id/start-delivery", post(start_delivery))
        .route("/delivery/:id/rider-location", patch(rider_location))
        .route("/delivery/:id/delivered", post(delivered))
}

#[derive(Deserialize)]
pub struct CreateCourierRequest {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub vehicle: VehicleType,
}

#[derive(Deserialize)]
pub struct CourierRequest {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub courier_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct LocationAck {
    pub accepted: bool,
}

#[derive(Deserialize)]
pub struct DeliveredRequest {
    pub courier_id: Uuid,
    pub payment_method: PaymentMethod,
    pub cash_received: Option<Amount>,
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCourierRequest>,
) -> Result<Json<Courier>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    let courier = Courier {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        phone: payload.phone,
        vehicle: payload.vehicle,
        created_at: Utc::now(),
    };

    state.couriers.insert(courier.id, courier.clone());
    Ok(Json(courier))
}

async fn list_couriers(State(state): State<Arc<AppState>>) -> Json<Vec<Courier>> {
    let couriers = state
        .couriers
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(couriers)
}

async fn active_deliveries(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryOrder>>, AppError> {
    state.courier_exists(id)?;

    let mut orders: Vec<DeliveryOrder> = state
        .store
        .list_by_courier(id)
        .await?
        .into_iter()
        .filter(|order| order.status.tracks_position())
        .collect();
    orders.sort_by_key(|order| order.delivery_started_at.or(order.picked_up_at));

    Ok(Json(orders))
}

async fn pending_pickup(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PoolEntry>>, AppError> {
    Ok(Json(state.pool.snapshot().await?))
}

async fn pickup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    state.courier_exists(payload.courier_id)?;
    Ok(Json(state.pool.claim(id, payload.courier_id).await?))
}

async fn start_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    let order = state
        .machine
        .apply(id, Actor::Courier(payload.courier_id), Transition::StartDelivery)
        .await?;
    Ok(Json(order))
}

/// Best effort: a dropped sample is still a 202.
async fn rider_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<(StatusCode, Json<LocationAck>), AppError> {
    let point = GeoPoint {
        lat: payload.lat,
        lng: payload.lng,
    };
    geo::validate(&point)?;

    let outcome = state
        .tracker
        .ingest(PositionSample {
            order_id: id,
            courier_id: payload.courier_id,
            point,
            recorded_at: payload.recorded_at.unwrap_or_else(Utc::now),
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(LocationAck {
            accepted: outcome == SampleOutcome::Accepted,
        }),
    ))
}

async fn delivered(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DeliveredRequest>,
) -> Result<Json<DeliveryOrder>, AppError> {
    let declaration = PaymentDeclaration {
        method: payload.payment_method,
        cash_received: payload.cash_received,
    };
    let order = state
        .machine
        .apply(
            id,
            Actor::Courier(payload.courier_id),
            Transition::Deliver(declaration),
        )
        .await?;
    Ok(Json(order))
}
