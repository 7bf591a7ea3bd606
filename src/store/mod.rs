//! Order Record Store contract.
//!
//! Every status change goes through [`OrderStore::conditional_update`], which
//! applies a [`StatusUpdate`] only if the row still matches the expected
//! `(status, assigned_courier)` pair. A relational backend maps this onto
//! `UPDATE ... WHERE status = $expected AND <courier guard> RETURNING *`.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::courier::PositionFix;
use crate::models::order::{DeliveryOrder, OrderStatus, Settlement};

pub use memory::InMemoryOrderStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    NotFound(Uuid),

    #[error("order {0} already exists")]
    Duplicate(Uuid),

    /// The guard did not match; `actual` is the row as it stands.
    #[error("guard conflict on order {}", actual.id)]
    Conflict { actual: Box<DeliveryOrder> },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourierGuard {
    Any,
    Unassigned,
    Is(Uuid),
}

impl CourierGuard {
    pub fn admits(&self, assigned: Option<Uuid>) -> bool {
        match self {
            CourierGuard::Any => true,
            CourierGuard::Unassigned => assigned.is_none(),
            CourierGuard::Is(id) => assigned == Some(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CourierChange {
    Keep,
    Assign(Uuid),
    Clear,
}

/// A guarded status change plus the fields written alongside it.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub expected: OrderStatus,
    pub courier_guard: CourierGuard,
    pub next: OrderStatus,
    pub courier: CourierChange,
    pub settlement: Option<Settlement>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn matches(&self, order: &DeliveryOrder) -> bool {
        order.status == self.expected && self.courier_guard.admits(order.assigned_courier)
    }

    /// Writes the update into `order`. Callers must have checked [`Self::matches`].
    pub fn apply_to(&self, order: &mut DeliveryOrder) {
        // Lifecycle timestamps never run backwards even if clocks do.
        let at = self.at.max(order.updated_at);

        order.status = self.next;
        match self.courier {
            CourierChange::Keep => {}
            CourierChange::Assign(id) => order.assigned_courier = Some(id),
            CourierChange::Clear => order.assigned_courier = None,
        }
        if !self.next.tracks_position() {
            order.courier_position = None;
        }
        if order.settlement.is_none() {
            order.settlement = self.settlement.clone();
        }

        let stamp = match self.next {
            OrderStatus::Pending => None,
            OrderStatus::Confirmed => Some(&mut order.confirmed_at),
            OrderStatus::Preparing => None,
            OrderStatus::Ready => Some(&mut order.ready_at),
            OrderStatus::PickedUp => Some(&mut order.picked_up_at),
            OrderStatus::Delivering => Some(&mut order.delivery_started_at),
            OrderStatus::Delivered => Some(&mut order.delivered_at),
            OrderStatus::Completed => Some(&mut order.completed_at),
            OrderStatus::Cancelled => Some(&mut order.cancelled_at),
        };
        if let Some(slot) = stamp {
            slot.get_or_insert(at);
        }
        order.updated_at = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionWrite {
    Applied,
    /// Order is no longer tracking, or the courier is not the assignee.
    Rejected,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: DeliveryOrder) -> Result<(), StoreError>;

    async fn get(&self, order_id: Uuid) -> Result<DeliveryOrder, StoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<DeliveryOrder>, StoreError>;

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<DeliveryOrder>, StoreError>;

    async fn list_all(&self) -> Result<Vec<DeliveryOrder>, StoreError>;

    async fn list_by_courier(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, StoreError>;

    /// Atomic check-and-set; fails with [`StoreError::Conflict`] when the
    /// guard does not match.
    async fn conditional_update(
        &self,
        order_id: Uuid,
        update: StatusUpdate,
    ) -> Result<DeliveryOrder, StoreError>;

    /// Overwrites the last-known position, guarded by tracking status and assignee.
    async fn record_position(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        fix: PositionFix,
    ) -> Result<PositionWrite, StoreError>;
}
