use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub courier_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionUpdate {
    pub order_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Event delivered to the observers of a single order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum TrackingEvent {
    StatusChanged(StatusChange),
    PositionUpdated(PositionUpdate),
}

impl TrackingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TrackingEvent::StatusChanged(_) => "status-changed",
            TrackingEvent::PositionUpdated(_) => "position-updated",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            TrackingEvent::StatusChanged(change) => change.order_id,
            TrackingEvent::PositionUpdated(update) => update.order_id,
        }
    }
}

/// Event delivered to the dispatcher feed, covering every order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum DispatchEvent {
    OrderCreated {
        order_id: Uuid,
        customer_name: String,
        total_amount: i64,
    },
    StatusChanged(StatusChange),
    StaleReady {
        order_id: Uuid,
        ready_since: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_event_serializes_with_type_and_payload() {
        let event = TrackingEvent::PositionUpdated(PositionUpdate {
            order_id: Uuid::nil(),
            lat: 13.75,
            lng: 100.5,
            recorded_at: Utc::now(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "position-updated");
        assert_eq!(value["payload"]["lat"], 13.75);
        assert_eq!(value["payload"]["lng"], 100.5);
    }

    #[test]
    fn status_change_uses_snake_case_states() {
        let event = TrackingEvent::StatusChanged(StatusChange {
            order_id: Uuid::nil(),
            from: OrderStatus::Ready,
            to: OrderStatus::PickedUp,
            courier_id: None,
            at: Utc::now(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "status-changed");
        assert_eq!(value["payload"]["to"], "picked_up");
    }
}
