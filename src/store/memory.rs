use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::courier::PositionFix;
use crate::models::order::{DeliveryOrder, OrderStatus};
use crate::store::{OrderStore, PositionWrite, StatusUpdate, StoreError};

/// Process-local store. Guards are evaluated while holding the shard write
/// lock, so check and write are a single step.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<Uuid, DeliveryOrder>,
    tokens: DashMap<String, Uuid>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect<F>(&self, keep: F) -> Vec<DeliveryOrder>
    where
        F: Fn(&DeliveryOrder) -> bool,
    {
        self.orders
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: DeliveryOrder) -> Result<(), StoreError> {
        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(order.id)),
            Entry::Vacant(slot) => {
                self.tokens.insert(order.tracking_token.clone(), order.id);
                slot.insert(order);
                Ok(())
            }
        }
    }

    async fn get(&self, order_id: Uuid) -> Result<DeliveryOrder, StoreError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(order_id))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<DeliveryOrder>, StoreError> {
        let Some(order_id) = self.tokens.get(token).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self.orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<DeliveryOrder>, StoreError> {
        Ok(self.collect(|order| order.status == status))
    }

    async fn list_all(&self) -> Result<Vec<DeliveryOrder>, StoreError> {
        Ok(self.collect(|_| true))
    }

    async fn list_by_courier(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, StoreError> {
        Ok(self.collect(|order| order.assigned_courier == Some(courier_id)))
    }

    async fn conditional_update(
        &self,
        order_id: Uuid,
        update: StatusUpdate,
    ) -> Result<DeliveryOrder, StoreError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound(order_id))?;

        if !update.matches(&order) {
            return Err(StoreError::Conflict {
                actual: Box::new(order.clone()),
            });
        }

        update.apply_to(&mut order);
        Ok(order.clone())
    }

    async fn record_position(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        fix: PositionFix,
    ) -> Result<PositionWrite, StoreError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::NotFound(order_id))?;

        if !order.status.tracks_position() || order.assigned_courier != Some(courier_id) {
            return Ok(PositionWrite::Rejected);
        }

        order.courier_position = Some(fix);
        Ok(PositionWrite::Applied)
    }
}
