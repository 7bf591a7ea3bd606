use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::{GeoPoint, PositionFix};

/// Money in the currency's minor unit.
pub type Amount = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    PickedUp,
    Delivering,
    Delivered,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 9] = [
        OrderStatus::Pending,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Ready,
        OrderStatus::PickedUp,
        OrderStatus::Delivering,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::Delivering => "delivering",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// States in which an assigned courier must be present.
    pub fn requires_courier(&self) -> bool {
        matches!(
            self,
            OrderStatus::PickedUp
                | OrderStatus::Delivering
                | OrderStatus::Delivered
                | OrderStatus::Completed
        )
    }

    /// States in which courier position samples are accepted.
    pub fn tracks_position(&self) -> bool {
        matches!(self, OrderStatus::PickedUp | OrderStatus::Delivering)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn in_kitchen_queue(&self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Preparing)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| format!("unknown order status: {raw}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub product_id: Option<i64>,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Amount,
}

impl LineItem {
    pub fn line_total(&self) -> Amount {
        self.unit_price.saturating_mul(self.quantity as Amount)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Transfer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settlement {
    pub method: PaymentMethod,
    pub cash_received: Option<Amount>,
    pub change: Amount,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOrder {
    pub id: Uuid,
    pub status: OrderStatus,
    pub customer_name: String,
    pub customer_phone: String,
    pub delivery_address: String,
    /// Address-only orders leave this empty and are geocoded downstream.
    pub destination: Option<GeoPoint>,
    pub note: Option<String>,
    pub items: Vec<LineItem>,
    pub subtotal: Amount,
    pub delivery_fee: Amount,
    pub discount: Amount,
    pub deposit: Amount,
    pub total_amount: Amount,
    pub assigned_courier: Option<Uuid>,
    pub courier_position: Option<PositionFix>,
    pub tracking_token: String,
    pub settlement: Option<Settlement>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivery_started_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Opaque customer-facing token: `TRK` followed by 32 uppercase hex digits.
pub fn new_tracking_token() -> String {
    format!("TRK{}", Uuid::new_v4().simple()).to_uppercase()
}

impl DeliveryOrder {
    /// Item subtotal plus fee, less discount and deposit, never below zero.
    pub fn compute_total(
        items: &[LineItem],
        delivery_fee: Amount,
        discount: Amount,
        deposit: Amount,
    ) -> (Amount, Amount) {
        let subtotal = items
            .iter()
            .map(LineItem::line_total)
            .fold(0, Amount::saturating_add);
        let total = subtotal
            .saturating_add(delivery_fee)
            .saturating_sub(discount)
            .saturating_sub(deposit)
            .max(0);
        (subtotal, total)
    }

    /// `assigned_courier` is set exactly in the courier-bearing states and
    /// the last-known position only while tracking.
    pub fn holds_invariants(&self) -> bool {
        let courier_ok = self.assigned_courier.is_some() == self.status.requires_courier();
        let position_ok = self.courier_position.is_none() || self.status.tracks_position();
        courier_ok && position_ok
    }
}
