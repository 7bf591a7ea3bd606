use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::rest::ws;
use crate::engine::broadcast::Subscription;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::courier::{GeoPoint, PositionFix, VehicleType};
use crate::models::order::{Amount, DeliveryOrder, LineItem, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tracking/:token", get(tracking_snapshot))
        .route("/tracking/:token/events", get(tracking_events))
        .route("/tracking/:token/ws", get(ws::tracking_ws))
}

#[derive(Debug, Clone, Serialize)]
pub struct CourierContact {
    pub name: String,
    pub phone: String,
    pub vehicle: VehicleType,
}

/// What an unauthenticated customer may see about their order.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub customer_name: String,
    pub delivery_address: String,
    pub destination: Option<GeoPoint>,
    pub items: Vec<LineItem>,
    pub delivery_fee: Amount,
    pub total_amount: Amount,
    pub courier: Option<CourierContact>,
    pub courier_position: Option<PositionFix>,
    pub distance_remaining_km: Option<f64>,
    pub queue_position: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivery_started_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// 1-based place among orders waiting on the kitchen, if this one is.
async fn queue_position(state: &AppState, order: &DeliveryOrder) -> Result<Option<usize>, AppError> {
    if !order.status.in_kitchen_queue() {
        return Ok(None);
    }

    let mut ahead = 0;
    for status in [OrderStatus::Confirmed, OrderStatus::Preparing] {
        ahead += state
            .store
            .list_by_status(status)
            .await?
            .iter()
            .filter(|other| other.id != order.id && other.created_at < order.created_at)
            .count();
    }
    Ok(Some(ahead + 1))
}

pub async fn build_snapshot(
    state: &AppState,
    order: &DeliveryOrder,
) -> Result<TrackingSnapshot, AppError> {
    let courier = order
        .assigned_courier
        .and_then(|id| state.couriers.get(&id).map(|entry| entry.value().clone()))
        .map(|courier| CourierContact {
            name: courier.name,
            phone: courier.phone,
            vehicle: courier.vehicle,
        });

    let courier_position = order
        .courier_position
        .filter(|_| order.status.tracks_position());
    let distance_remaining_km = match (&courier_position, &order.destination) {
        (Some(fix), Some(destination)) => Some(haversine_km(&fix.point(), destination)),
        _ => None,
    };

    Ok(TrackingSnapshot {
        order_id: order.id,
        status: order.status,
        customer_name: order.customer_name.clone(),
        delivery_address: order.delivery_address.clone(),
        destination: order.destination,
        items: order.items.clone(),
        delivery_fee: order.delivery_fee,
        total_amount: order.total_amount,
        courier,
        courier_position,
        distance_remaining_km,
        queue_position: queue_position(state, order).await?,
        created_at: order.created_at,
        confirmed_at: order.confirmed_at,
        picked_up_at: order.picked_up_at,
        delivery_started_at: order.delivery_started_at,
        delivered_at: order.delivered_at,
        updated_at: order.updated_at,
    })
}

/// Poll-on-demand fallback for clients that cannot hold a subscription.
async fn tracking_snapshot(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<TrackingSnapshot>, AppError> {
    let order = state.order_by_token(&token).await?;
    Ok(Json(build_snapshot(&state, &order).await?))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match serde_json::to_string(payload) {
        Ok(json) => Event::default().event(name).data(json),
        Err(err) => {
            warn!(error = %err, "failed to serialize tracking event for sse");
            Event::default().event("error").data("serialization failed")
        }
    }
}

/// Live events for one order; the stream ends once the order is finished.
fn live_events(subscription: Option<Subscription>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(subscription, |subscription| async move {
        let mut subscription = subscription?;
        let event = subscription.recv().await?;
        Some((event, Some(subscription)))
    })
    .map(|event| Ok(sse_event(event.name(), &event)))
}

async fn tracking_events(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (order, subscription) = state.open_tracking(&token).await?;
    let snapshot = build_snapshot(&state, &order).await?;

    let live = if order.status.is_terminal() {
        drop(subscription);
        None
    } else {
        Some(subscription)
    };

    info!(order_id = %order.id, "tracking stream opened");

    let first = sse_event("snapshot", &snapshot);
    let events = stream::once(async move { Ok::<_, Infallible>(first) }).chain(live_events(live));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
