//! Delivery order state machine.
//!
//! ```text
//! pending -> confirmed -> preparing -> ready -> picked_up -> delivering -> delivered -> completed
//!    \___________\____________\__________\__________\___________\
//!                                                                 -> cancelled
//! ```
//!
//! [`StateMachine::apply`] is the only path that changes an order's status.
//! It checks the actor and the source state against the current row, then
//! commits with a guarded update so a concurrent writer cannot slip in
//! between the check and the write.
//!
//! Transitions on the same order take turns on a per-order lane that is held
//! through the post-commit work, so tracker arming and published status
//! events follow commit order.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::broadcast::Broadcaster;
use crate::engine::settlement::{settle, PaymentDeclaration};
use crate::engine::tracker::PositionTracker;
use crate::error::AppError;
use crate::models::event::{DispatchEvent, StatusChange, TrackingEvent};
use crate::models::order::{DeliveryOrder, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::{CourierChange, CourierGuard, OrderStore, StatusUpdate, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Kitchen,
    Admin,
    Courier(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Confirm,
    StartPreparing,
    MarkReady,
    Claim,
    StartDelivery,
    Deliver(PaymentDeclaration),
    Complete,
    Cancel,
}

const CANCELLABLE: &[OrderStatus] = &[
    OrderStatus::Pending,
    OrderStatus::Confirmed,
    OrderStatus::Preparing,
    OrderStatus::Ready,
    OrderStatus::PickedUp,
    OrderStatus::Delivering,
];

impl Transition {
    pub fn target(&self) -> OrderStatus {
        match self {
            Transition::Confirm => OrderStatus::Confirmed,
            Transition::StartPreparing => OrderStatus::Preparing,
            Transition::MarkReady => OrderStatus::Ready,
            Transition::Claim => OrderStatus::PickedUp,
            Transition::StartDelivery => OrderStatus::Delivering,
            Transition::Deliver(_) => OrderStatus::Delivered,
            Transition::Complete => OrderStatus::Completed,
            Transition::Cancel => OrderStatus::Cancelled,
        }
    }

    fn sources(&self) -> &'static [OrderStatus] {
        match self {
            Transition::Confirm => &[OrderStatus::Pending],
            Transition::StartPreparing => &[OrderStatus::Confirmed],
            Transition::MarkReady => &[OrderStatus::Preparing],
            Transition::Claim => &[OrderStatus::Ready],
            Transition::StartDelivery => &[OrderStatus::PickedUp],
            Transition::Deliver(_) => &[OrderStatus::Delivering],
            Transition::Complete => &[OrderStatus::Delivered],
            Transition::Cancel => CANCELLABLE,
        }
    }

    fn permits(&self, actor: Actor) -> bool {
        match self {
            Transition::Confirm => matches!(actor, Actor::Kitchen | Actor::Admin),
            Transition::StartPreparing | Transition::MarkReady => actor == Actor::Kitchen,
            Transition::Claim | Transition::StartDelivery | Transition::Deliver(_) => {
                matches!(actor, Actor::Courier(_))
            }
            Transition::Complete | Transition::Cancel => actor == Actor::Admin,
        }
    }

    fn courier_guard(&self, actor: Actor) -> CourierGuard {
        match (self, actor) {
            (Transition::Claim, _) => CourierGuard::Unassigned,
            (Transition::StartDelivery | Transition::Deliver(_), Actor::Courier(id)) => {
                CourierGuard::Is(id)
            }
            _ => CourierGuard::Any,
        }
    }

    fn courier_change(&self, actor: Actor) -> CourierChange {
        match (self, actor) {
            (Transition::Claim, Actor::Courier(id)) => CourierChange::Assign(id),
            (Transition::Cancel, _) => CourierChange::Clear,
            _ => CourierChange::Keep,
        }
    }
}

pub struct StateMachine {
    store: Arc<dyn OrderStore>,
    tracker: Arc<PositionTracker>,
    broadcaster: Arc<Broadcaster>,
    lanes: DashMap<Uuid, Arc<Mutex<()>>>,
    metrics: Metrics,
}

impl StateMachine {
    pub fn new(
        store: Arc<dyn OrderStore>,
        tracker: Arc<PositionTracker>,
        broadcaster: Arc<Broadcaster>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            tracker,
            broadcaster,
            lanes: DashMap::new(),
            metrics,
        }
    }

    fn lane(&self, order_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.lanes.entry(order_id).or_default().value())
    }

    pub async fn apply(
        &self,
        order_id: Uuid,
        actor: Actor,
        transition: Transition,
    ) -> Result<DeliveryOrder, AppError> {
        let lane = self.lane(order_id);
        let _turn = lane.lock().await;

        let start = Instant::now();
        let result = self.commit(order_id, actor, transition).await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .transition_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());

        let (previous, order) = result?;
        self.after_commit(previous, &order).await;
        Ok(order)
    }

    async fn commit(
        &self,
        order_id: Uuid,
        actor: Actor,
        transition: Transition,
    ) -> Result<(OrderStatus, DeliveryOrder), AppError> {
        let current = self.store.get(order_id).await?;
        let to = transition.target();
        let guard = transition.courier_guard(actor);

        let admissible = transition.permits(actor)
            && transition.sources().contains(&current.status)
            && guard.admits(current.assigned_courier);
        if !admissible {
            return Err(rejection(&current, actor, transition));
        }

        let now = Utc::now();
        let settlement = match &transition {
            Transition::Deliver(declaration) => {
                Some(settle(current.total_amount, declaration, now)?)
            }
            _ => None,
        };

        let update = StatusUpdate {
            expected: current.status,
            courier_guard: guard,
            next: to,
            courier: transition.courier_change(actor),
            settlement,
            at: now,
        };

        match self.store.conditional_update(order_id, update).await {
            Ok(order) => Ok((current.status, order)),
            Err(StoreError::Conflict { actual }) => Err(rejection(&actual, actor, transition)),
            Err(err) => Err(err.into()),
        }
    }

    async fn after_commit(&self, from: OrderStatus, order: &DeliveryOrder) {
        match order.status {
            OrderStatus::PickedUp | OrderStatus::Delivering => {
                if let Some(courier_id) = order.assigned_courier {
                    self.tracker.arm(order.id, courier_id, order.courier_position);
                }
            }
            OrderStatus::Delivered | OrderStatus::Completed | OrderStatus::Cancelled => {
                self.tracker.disarm(order.id).await;
            }
            _ => {}
        }

        let change = StatusChange {
            order_id: order.id,
            from,
            to: order.status,
            courier_id: order.assigned_courier,
            at: order.updated_at,
        };
        self.broadcaster
            .publish(TrackingEvent::StatusChanged(change.clone()));
        self.broadcaster.dispatch(DispatchEvent::StatusChanged(change));
        if order.status.is_terminal() {
            self.broadcaster.close(order.id);
            // Nothing commits after a terminal state.
            self.lanes.remove(&order.id);
        }

        self.metrics
            .transitions_total
            .with_label_values(&[order.status.as_str()])
            .inc();

        info!(
            order_id = %order.id,
            from = %from,
            to = %order.status,
            "order status changed"
        );
    }
}

/// Explains why `transition` cannot apply to `order` as it stands.
fn rejection(order: &DeliveryOrder, actor: Actor, transition: Transition) -> AppError {
    if let (Transition::Claim, Actor::Courier(courier_id)) = (transition, actor) {
        if let Some(holder) = order.assigned_courier {
            if holder != courier_id {
                debug!(order_id = %order.id, courier_id = %courier_id, "claim lost");
                return AppError::AlreadyClaimed(order.id);
            }
        }
    }

    AppError::InvalidTransition {
        from: order.status,
        to: transition.target(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryOrderStore;
    use crate::test_support::sample_order;

    struct Fixture {
        store: Arc<InMemoryOrderStore>,
        tracker: Arc<PositionTracker>,
        broadcaster: Arc<Broadcaster>,
        machine: StateMachine,
    }

    fn fixture() -> Fixture {
        let metrics = Metrics::new();
        let store = Arc::new(InMemoryOrderStore::new());
        let broadcaster = Arc::new(Broadcaster::new(16, 16, metrics.clone()));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let machine = StateMachine::new(
            store.clone(),
            tracker.clone(),
            broadcaster.clone(),
            metrics,
        );

        Fixture {
            store,
            tracker,
            broadcaster,
            machine,
        }
    }

    async fn seeded(fx: &Fixture, status: OrderStatus) -> Uuid {
        let order = sample_order(status);
        let id = order.id;
        fx.store.insert(order).await.unwrap();
        id
    }

    async fn to_ready(fx: &Fixture) -> Uuid {
        let id = seeded(fx, OrderStatus::Pending).await;
        for (actor, transition) in [
            (Actor::Kitchen, Transition::Confirm),
            (Actor::Kitchen, Transition::StartPreparing),
            (Actor::Kitchen, Transition::MarkReady),
        ] {
            fx.machine.apply(id, actor, transition).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn kitchen_moves_order_to_ready_with_timestamps() {
        let fx = fixture();
        let id = to_ready(&fx).await;

        let order = fx.store.get(id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Ready);
        assert!(order.confirmed_at.is_some());
        assert!(order.ready_at.unwrap() >= order.confirmed_at.unwrap());
        assert!(order.holds_invariants());
    }

    #[tokio::test]
    async fn skipping_a_state_is_rejected_without_mutation() {
        let fx = fixture();
        let id = seeded(&fx, OrderStatus::Pending).await;

        let err = fx
            .machine
            .apply(id, Actor::Kitchen, Transition::MarkReady)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: OrderStatus::Pending,
                to: OrderStatus::Ready
            }
        ));
        assert_eq!(fx.store.get(id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn unauthorized_actor_is_rejected() {
        let fx = fixture();
        let id = seeded(&fx, OrderStatus::Pending).await;

        let err = fx
            .machine
            .apply(id, Actor::Courier(Uuid::new_v4()), Transition::Confirm)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let err = fx
            .machine
            .apply(id, Actor::Kitchen, Transition::Cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn reapplying_a_transition_is_rejected() {
        let fx = fixture();
        let id = seeded(&fx, OrderStatus::Pending).await;

        fx.machine.apply(id, Actor::Admin, Transition::Confirm).await.unwrap();
        let err = fx
            .machine
            .apply(id, Actor::Admin, Transition::Confirm)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidTransition {
                from: OrderStatus::Confirmed,
                to: OrderStatus::Confirmed
            }
        ));
    }

    #[tokio::test]
    async fn second_claim_by_same_courier_is_invalid_and_keeps_assignee() {
        let fx = fixture();
        let id = to_ready(&fx).await;
        let courier = Uuid::new_v4();

        fx.machine
            .apply(id, Actor::Courier(courier), Transition::Claim)
            .await
            .unwrap();
        let err = fx
            .machine
            .apply(id, Actor::Courier(courier), Transition::Claim)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(fx.store.get(id).await.unwrap().assigned_courier, Some(courier));
    }

    #[tokio::test]
    async fn claim_by_another_courier_after_pickup_is_already_claimed() {
        let fx = fixture();
        let id = to_ready(&fx).await;
        let winner = Uuid::new_v4();

        fx.machine
            .apply(id, Actor::Courier(winner), Transition::Claim)
            .await
            .unwrap();
        let err = fx
            .machine
            .apply(id, Actor::Courier(Uuid::new_v4()), Transition::Claim)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::AlreadyClaimed(order) if order == id));
    }

    #[tokio::test]
    async fn only_assigned_courier_may_start_delivery() {
        let fx = fixture();
        let id = to_ready(&fx).await;
        let assigned = Uuid::new_v4();
        fx.machine
            .apply(id, Actor::Courier(assigned), Transition::Claim)
            .await
            .unwrap();

        let err = fx
            .machine
            .apply(id, Actor::Courier(Uuid::new_v4()), Transition::StartDelivery)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        let order = fx
            .machine
            .apply(id, Actor::Courier(assigned), Transition::StartDelivery)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Delivering);
        assert!(fx.tracker.is_armed(id));
    }

    #[tokio::test]
    async fn insufficient_cash_leaves_order_delivering() {
        let fx = fixture();
        let id = to_ready(&fx).await;
        let courier = Uuid::new_v4();
        for transition in [Transition::Claim, Transition::StartDelivery] {
            fx.machine
                .apply(id, Actor::Courier(courier), transition)
                .await
                .unwrap();
        }

        let err = fx
            .machine
            .apply(
                id,
                Actor::Courier(courier),
                Transition::Deliver(PaymentDeclaration::cash(400)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientPayment { .. }));
        assert_eq!(fx.store.get(id).await.unwrap().status, OrderStatus::Delivering);

        let order = fx
            .machine
            .apply(
                id,
                Actor::Courier(courier),
                Transition::Deliver(PaymentDeclaration::cash(500)),
            )
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Delivered);
        assert_eq!(order.settlement.as_ref().unwrap().change, 80);
        assert!(order.courier_position.is_none());
        assert!(!fx.tracker.is_armed(id));
        assert!(order.holds_invariants());
    }

    #[tokio::test]
    async fn cancel_clears_courier_and_disarms_tracker() {
        let fx = fixture();
        let id = to_ready(&fx).await;
        let courier = Uuid::new_v4();
        fx.machine
            .apply(id, Actor::Courier(courier), Transition::Claim)
            .await
            .unwrap();
        assert!(fx.tracker.is_armed(id));

        let order = fx
            .machine
            .apply(id, Actor::Admin, Transition::Cancel)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.assigned_courier.is_none());
        assert!(!fx.tracker.is_armed(id));
        assert!(order.holds_invariants());
    }

    #[tokio::test]
    async fn delivered_order_cannot_be_cancelled() {
        let fx = fixture();
        let mut order = sample_order(OrderStatus::Delivered);
        order.assigned_courier = Some(Uuid::new_v4());
        let id = order.id;
        fx.store.insert(order).await.unwrap();

        let err = fx
            .machine
            .apply(id, Actor::Admin, Transition::Cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn transitions_are_published_to_observers() {
        let fx = fixture();
        let id = seeded(&fx, OrderStatus::Pending).await;
        let mut sub = fx.broadcaster.subscribe(id);
        let mut dispatch = fx.broadcaster.subscribe_dispatch();

        fx.machine.apply(id, Actor::Kitchen, Transition::Confirm).await.unwrap();

        match sub.recv().await {
            Some(TrackingEvent::StatusChanged(change)) => {
                assert_eq!(change.from, OrderStatus::Pending);
                assert_eq!(change.to, OrderStatus::Confirmed);
            }
            other => panic!("expected status change, got {other:?}"),
        }
        assert!(matches!(
            dispatch.recv().await,
            Ok(DispatchEvent::StatusChanged(_))
        ));
    }

    #[tokio::test]
    async fn terminal_transition_closes_observer_streams() {
        let fx = fixture();
        let id = seeded(&fx, OrderStatus::Pending).await;
        let mut sub = fx.broadcaster.subscribe(id);

        fx.machine.apply(id, Actor::Admin, Transition::Cancel).await.unwrap();

        assert!(matches!(sub.recv().await, Some(TrackingEvent::StatusChanged(_))));
        assert!(sub.recv().await.is_none());
    }

    /// Holds a successful claim back before returning it to the machine.
    struct SlowClaimStore {
        inner: InMemoryOrderStore,
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl OrderStore for SlowClaimStore {
        async fn insert(&self, order: DeliveryOrder) -> Result<(), StoreError> {
            self.inner.insert(order).await
        }

        async fn get(&self, order_id: Uuid) -> Result<DeliveryOrder, StoreError> {
            self.inner.get(order_id).await
        }

        async fn find_by_token(&self, token: &str) -> Result<Option<DeliveryOrder>, StoreError> {
            self.inner.find_by_token(token).await
        }

        async fn list_by_status(
            &self,
            status: OrderStatus,
        ) -> Result<Vec<DeliveryOrder>, StoreError> {
            self.inner.list_by_status(status).await
        }

        async fn list_all(&self) -> Result<Vec<DeliveryOrder>, StoreError> {
            self.inner.list_all().await
        }

        async fn list_by_courier(&self, courier_id: Uuid) -> Result<Vec<DeliveryOrder>, StoreError> {
            self.inner.list_by_courier(courier_id).await
        }

        async fn conditional_update(
            &self,
            order_id: Uuid,
            update: StatusUpdate,
        ) -> Result<DeliveryOrder, StoreError> {
            let order = self.inner.conditional_update(order_id, update).await?;
            if order.status == OrderStatus::PickedUp {
                tokio::time::sleep(self.delay).await;
            }
            Ok(order)
        }

        async fn record_position(
            &self,
            order_id: Uuid,
            courier_id: Uuid,
            fix: crate::models::courier::PositionFix,
        ) -> Result<crate::store::PositionWrite, StoreError> {
            self.inner.record_position(order_id, courier_id, fix).await
        }
    }

    #[tokio::test]
    async fn cancel_during_slow_claim_is_applied_after_it() {
        let metrics = Metrics::new();
        let store = Arc::new(SlowClaimStore {
            inner: InMemoryOrderStore::new(),
            delay: std::time::Duration::from_millis(200),
        });
        let broadcaster = Arc::new(Broadcaster::new(16, 16, metrics.clone()));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            tracker.clone(),
            broadcaster.clone(),
            metrics,
        ));

        let order = sample_order(OrderStatus::Ready);
        let id = order.id;
        store.insert(order).await.unwrap();
        let mut dispatch = broadcaster.subscribe_dispatch();

        let claimer = {
            let machine = machine.clone();
            tokio::spawn(async move {
                machine
                    .apply(id, Actor::Courier(Uuid::new_v4()), Transition::Claim)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let cancelled = machine
            .apply(id, Actor::Admin, Transition::Cancel)
            .await
            .unwrap();
        claimer.await.unwrap().unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(store.get(id).await.unwrap().status, OrderStatus::Cancelled);
        assert!(!tracker.is_armed(id));
        assert_eq!(tracker.armed_count(), 0);

        let mut seen = Vec::new();
        while let Ok(DispatchEvent::StatusChanged(change)) = dispatch.try_recv() {
            seen.push(change.to);
        }
        assert_eq!(seen, vec![OrderStatus::PickedUp, OrderStatus::Cancelled]);
    }
}
