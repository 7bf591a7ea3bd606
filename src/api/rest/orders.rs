use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::transitions::{Actor, Transition};
use crate::error::AppError;
use crate::geo;
use crate::models::courier::GeoPoint;
use crate::models::event::DispatchEvent;
use crate::models::order::{new_tracking_token, Amount, DeliveryOrder, LineItem, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/delivery/settings", get(delivery_settings))
        .route("/kitchen/orders/:id/confirm", post(kitchen_confirm))
        .route("/kitchen/orders/:id/preparing", post(kitchen_preparing))
        .route("/kitchen/orders/:id/ready", post(kitchen_ready))
        .route("/admin/orders/:id/confirm", post(admin_confirm))
        .route("/admin/orders/:id/cancel", post(admin_cancel))
        .route("/admin/orders/:id/complete", post(admin_complete))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub destination: Option<GeoPoint>,
    pub items: Vec<LineItem>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub discount: Amount,
    #[serde(default)]
    pub deposit: Amount,
}

#[derive(Serialize)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub tracking_token: String,
    pub tracking_url: String,
    pub total_amount: Amount,
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
struct DeliverySettings {
    minimum_order: Amount,
    delivery_fee: Amount,
    delivery_enabled: bool,
}

fn validate_request(payload: &CreateOrderRequest) -> Result<(), AppError> {
    if payload.customer_name.trim().is_empty() {
        return Err(AppError::BadRequest("customer_name cannot be empty".to_string()));
    }

    if payload.items.is_empty() {
        return Err(AppError::BadRequest("order must contain at least one item".to_string()));
    }

    if payload
        .items
        .iter()
        .any(|item| item.quantity == 0 || item.unit_price < 0)
    {
        return Err(AppError::BadRequest(
            "items need a positive quantity and a non-negative price".to_string(),
        ));
    }

    if payload.discount < 0 || payload.deposit < 0 {
        return Err(AppError::BadRequest(
            "discount and deposit must not be negative".to_string(),
        ));
    }

    if let Some(destination) = &payload.destination {
        geo::validate(destination)?;
    }

    Ok(())
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, AppError> {
    if !state.config.delivery_enabled {
        return Err(AppError::BadRequest("delivery is currently disabled".to_string()));
    }
    validate_request(&payload)?;

    let delivery_fee = state.config.delivery_fee;
    let (subtotal, total_amount) = DeliveryOrder::compute_total(
        &payload.items,
        delivery_fee,
        payload.discount,
        payload.deposit,
    );

    let minimum = state.config.min_delivery_order;
    if subtotal < minimum {
        return Err(AppError::BadRequest(format!(
            "minimum delivery order is {minimum}"
        )));
    }

    let now = Utc::now();
    let order = DeliveryOrder {
        id: Uuid::new_v4(),
        status: OrderStatus::Pending,
        customer_name: payload.customer_name.trim().to_string(),
        customer_phone: payload.customer_phone,
        delivery_address: payload.delivery_address,
        destination: payload.destination,
        note: payload.note,
        items: payload.items,
        subtotal,
        delivery_fee,
        discount: payload.discount,
        deposit: payload.deposit,
        total_amount,
        assigned_courier: None,
        courier_position: None,
        tracking_token: new_tracking_token(),
        settlement: None,
        created_at: now,
        confirmed_at: None,
        ready_at: None,
        picked_up_at: None,
        delivery_started_at: None,
        delivered_at: None,
        completed_at: None,
        cancelled_at: None,
        updated_at: now,
    };

    state.store.insert(order.clone()).await?;
    state.broadcaster.dispatch(DispatchEvent::OrderCreated {
        order_id: order.id,
        customer_name: order.customer_name.clone(),
        total_amount: order.total_amount,
    });

    info!(order_id = %order.id, total = order.total_amount, "delivery order received");

    Ok(Json(CreateOrderResponse {
        order_id: order.id,
        tracking_url: format!("/tracking/{}", order.tracking_token),
        tracking_token: order.tracking_token,
        total_amount: order.total_amount,
    }))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<DeliveryOrder>>, AppError> {
    let mut orders = match query.status.as_deref() {
        None | Some("all") => state.store.list_all().await?,
        Some(raw) => {
            let status = raw.parse::<OrderStatus>().map_err(AppError::BadRequest)?;
            state.store.list_by_status(status).await?
        }
    };

    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(orders))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(state.store.get(id).await?))
}

async fn delivery_settings(State(state): State<Arc<AppState>>) -> Json<DeliverySettings> {
    Json(DeliverySettings {
        minimum_order: state.config.min_delivery_order,
        delivery_fee: state.config.delivery_fee,
        delivery_enabled: state.config.delivery_enabled,
    })
}

async fn transition(
    state: &AppState,
    id: Uuid,
    actor: Actor,
    transition: Transition,
) -> Result<Json<DeliveryOrder>, AppError> {
    Ok(Json(state.machine.apply(id, actor, transition).await?))
}

async fn kitchen_confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    transition(&state, id, Actor::Kitchen, Transition::Confirm).await
}

async fn kitchen_preparing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    transition(&state, id, Actor::Kitchen, Transition::StartPreparing).await
}

async fn kitchen_ready(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    transition(&state, id, Actor::Kitchen, Transition::MarkReady).await
}

async fn admin_confirm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    transition(&state, id, Actor::Admin, Transition::Confirm).await
}

async fn admin_cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    transition(&state, id, Actor::Admin, Transition::Cancel).await
}

async fn admin_complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeliveryOrder>, AppError> {
    transition(&state, id, Actor::Admin, Transition::Complete).await
}
