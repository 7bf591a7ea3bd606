use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::broadcast::Broadcaster;
use crate::engine::transitions::{Actor, StateMachine, Transition};
use crate::error::AppError;
use crate::models::event::DispatchEvent;
use crate::models::order::{DeliveryOrder, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::OrderStore;

#[derive(Debug, Clone, Serialize)]
pub struct PoolEntry {
    #[serde(flatten)]
    pub order: DeliveryOrder,
    pub waiting_secs: i64,
    pub stale: bool,
}

/// Claimable view over `ready` orders with no courier.
///
/// The only state kept here is the set of staleness flags; membership is
/// always read from the store.
pub struct PickupPool {
    store: Arc<dyn OrderStore>,
    machine: Arc<StateMachine>,
    broadcaster: Arc<Broadcaster>,
    stale_after: chrono::Duration,
    flagged: DashMap<Uuid, DateTime<Utc>>,
    metrics: Metrics,
}

impl PickupPool {
    pub fn new(
        store: Arc<dyn OrderStore>,
        machine: Arc<StateMachine>,
        broadcaster: Arc<Broadcaster>,
        stale_after: std::time::Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            machine,
            broadcaster,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
            flagged: DashMap::new(),
            metrics,
        }
    }

    async fn members(&self) -> Result<Vec<DeliveryOrder>, AppError> {
        let mut orders: Vec<DeliveryOrder> = self
            .store
            .list_by_status(OrderStatus::Ready)
            .await?
            .into_iter()
            .filter(|order| order.assigned_courier.is_none())
            .collect();
        orders.sort_by_key(|order| order.ready_at.unwrap_or(order.created_at));
        Ok(orders)
    }

    /// Oldest first.
    pub async fn snapshot(&self) -> Result<Vec<PoolEntry>, AppError> {
        let now = Utc::now();
        let entries = self
            .members()
            .await?
            .into_iter()
            .map(|order| {
                let ready_since = order.ready_at.unwrap_or(order.created_at);
                PoolEntry {
                    waiting_secs: (now - ready_since).num_seconds().max(0),
                    stale: self.flagged.contains_key(&order.id),
                    order,
                }
            })
            .collect();
        Ok(entries)
    }

    /// Exactly one courier wins; everyone else gets `AlreadyClaimed` immediately.
    pub async fn claim(&self, order_id: Uuid, courier_id: Uuid) -> Result<DeliveryOrder, AppError> {
        let result = self
            .machine
            .apply(order_id, Actor::Courier(courier_id), Transition::Claim)
            .await;

        let outcome = match &result {
            Ok(_) => "won",
            Err(AppError::AlreadyClaimed(_)) => "lost",
            Err(_) => "rejected",
        };
        self.metrics
            .claims_total
            .with_label_values(&[outcome])
            .inc();

        match &result {
            Ok(_) => {
                if self.flagged.remove(&order_id).is_some() {
                    self.metrics.stale_ready_orders.set(self.flagged.len() as i64);
                }
                info!(order_id = %order_id, courier_id = %courier_id, "order claimed");
            }
            Err(err) => {
                debug!(order_id = %order_id, courier_id = %courier_id, error = %err, "claim refused")
            }
        }
        result
    }

    /// Flags pool members older than the staleness window for follow-up
    /// and returns the newly flagged ids. Never cancels anything.
    pub async fn flag_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let members = self.members().await?;
        self.flagged
            .retain(|id, _| members.iter().any(|order| order.id == *id));

        let mut newly_flagged = Vec::new();
        for order in &members {
            let ready_since = order.ready_at.unwrap_or(order.created_at);
            if now - ready_since < self.stale_after || self.flagged.contains_key(&order.id) {
                continue;
            }

            self.flagged.insert(order.id, ready_since);
            newly_flagged.push(order.id);
            warn!(
                order_id = %order.id,
                ready_since = %ready_since,
                "ready order unclaimed past staleness window"
            );
            self.broadcaster.dispatch(DispatchEvent::StaleReady {
                order_id: order.id,
                ready_since,
            });
        }

        self.metrics.stale_ready_orders.set(self.flagged.len() as i64);
        Ok(newly_flagged)
    }

    pub fn is_flagged(&self, order_id: Uuid) -> bool {
        self.flagged.contains_key(&order_id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::tracker::PositionTracker;
    use crate::store::InMemoryOrderStore;
    use crate::test_support::sample_order;

    struct Fixture {
        store: Arc<InMemoryOrderStore>,
        pool: Arc<PickupPool>,
    }

    fn fixture(stale_after: Duration) -> Fixture {
        let metrics = Metrics::new();
        let store = Arc::new(InMemoryOrderStore::new());
        let broadcaster = Arc::new(Broadcaster::new(16, 16, metrics.clone()));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            tracker,
            broadcaster.clone(),
            metrics.clone(),
        ));
        let pool = Arc::new(PickupPool::new(
            store.clone(),
            machine,
            broadcaster,
            stale_after,
            metrics,
        ));
        Fixture { store, pool }
    }

    async fn ready_order(fx: &Fixture, ready_at: DateTime<Utc>) -> Uuid {
        let mut order = sample_order(OrderStatus::Ready);
        order.ready_at = Some(ready_at);
        let id = order.id;
        fx.store.insert(order).await.unwrap();
        id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_claims_have_exactly_one_winner() {
        let fx = fixture(Duration::from_secs(900));
        let order_id = ready_order(&fx, Utc::now()).await;

        let couriers: Vec<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
        let handles: Vec<_> = couriers
            .iter()
            .map(|&courier_id| {
                let pool = fx.pool.clone();
                tokio::spawn(async move { (courier_id, pool.claim(order_id, courier_id).await) })
            })
            .collect();

        let mut winners = Vec::new();
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                (courier_id, Ok(_)) => winners.push(courier_id),
                (_, Err(AppError::AlreadyClaimed(_))) => losers += 1,
                (_, Err(other)) => panic!("unexpected claim error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(losers, couriers.len() - 1);

        let order = fx.store.get(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::PickedUp);
        assert_eq!(order.assigned_courier, Some(winners[0]));
        assert!(order.holds_invariants());
    }

    #[tokio::test]
    async fn claimed_order_leaves_the_snapshot() {
        let fx = fixture(Duration::from_secs(900));
        let first = ready_order(&fx, Utc::now() - chrono::Duration::minutes(2)).await;
        let second = ready_order(&fx, Utc::now()).await;

        let ids: Vec<Uuid> = fx.pool.snapshot().await.unwrap().iter().map(|e| e.order.id).collect();
        assert_eq!(ids, vec![first, second]);

        fx.pool.claim(first, Uuid::new_v4()).await.unwrap();

        let ids: Vec<Uuid> = fx.pool.snapshot().await.unwrap().iter().map(|e| e.order.id).collect();
        assert_eq!(ids, vec![second]);
    }

    #[tokio::test]
    async fn claiming_an_order_not_ready_is_invalid() {
        let fx = fixture(Duration::from_secs(900));
        let order = sample_order(OrderStatus::Preparing);
        let id = order.id;
        fx.store.insert(order).await.unwrap();

        let err = fx.pool.claim(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn stale_orders_are_flagged_once_and_not_cancelled() {
        let fx = fixture(Duration::from_secs(600));
        let old = ready_order(&fx, Utc::now() - chrono::Duration::minutes(15)).await;
        let fresh = ready_order(&fx, Utc::now()).await;

        let flagged = fx.pool.flag_stale(Utc::now()).await.unwrap();
        assert_eq!(flagged, vec![old]);
        assert!(fx.pool.flag_stale(Utc::now()).await.unwrap().is_empty());

        assert!(fx.pool.is_flagged(old));
        assert!(!fx.pool.is_flagged(fresh));
        assert_eq!(fx.store.get(old).await.unwrap().status, OrderStatus::Ready);

        let snapshot = fx.pool.snapshot().await.unwrap();
        assert!(snapshot.iter().any(|entry| entry.order.id == old && entry.stale));
    }

    #[tokio::test]
    async fn flag_is_dropped_once_order_leaves_pool() {
        let fx = fixture(Duration::from_secs(60));
        let old = ready_order(&fx, Utc::now() - chrono::Duration::minutes(5)).await;
        fx.pool.flag_stale(Utc::now()).await.unwrap();

        fx.pool.claim(old, Uuid::new_v4()).await.unwrap();

        assert!(!fx.pool.is_flagged(old));
    }
}
