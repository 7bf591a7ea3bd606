use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::broadcast::{Broadcaster, Subscription};
use crate::engine::pool::PickupPool;
use crate::engine::tracker::PositionTracker;
use crate::engine::transitions::StateMachine;
use crate::error::AppError;
use crate::models::courier::Courier;
use crate::models::order::DeliveryOrder;
use crate::observability::metrics::Metrics;
use crate::store::{InMemoryOrderStore, OrderStore};

/// Built once in `main` and handed to every handler.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn OrderStore>,
    pub couriers: DashMap<Uuid, Courier>,
    pub machine: Arc<StateMachine>,
    pub pool: PickupPool,
    pub tracker: Arc<PositionTracker>,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(InMemoryOrderStore::new()))
    }

    pub fn with_store(config: Config, store: Arc<dyn OrderStore>) -> Self {
        let metrics = Metrics::new();
        let broadcaster = Arc::new(Broadcaster::new(
            config.event_buffer_size,
            config.dispatch_buffer_size,
            metrics.clone(),
        ));
        let tracker = Arc::new(PositionTracker::new(
            store.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            tracker.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let pool = PickupPool::new(
            store.clone(),
            machine.clone(),
            broadcaster.clone(),
            config.stale_ready_after,
            metrics.clone(),
        );

        Self {
            config,
            store,
            couriers: DashMap::new(),
            machine,
            pool,
            tracker,
            broadcaster,
            metrics,
        }
    }

    pub fn courier_exists(&self, courier_id: Uuid) -> Result<(), AppError> {
        if self.couriers.contains_key(&courier_id) {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("courier {courier_id} not found")))
        }
    }

    pub async fn order_by_token(&self, token: &str) -> Result<DeliveryOrder, AppError> {
        self.store
            .find_by_token(token)
            .await?
            .ok_or(AppError::UnknownTrackingToken)
    }

    /// Resolves a tracking token into a live subscription for that order
    /// only. Unknown tokens fail before anything is registered.
    ///
    /// The subscription is opened before the snapshot is read so no
    /// transition can fall between the two.
    pub async fn open_tracking(
        &self,
        token: &str,
    ) -> Result<(DeliveryOrder, Subscription), AppError> {
        let order = self.order_by_token(token).await?;
        let subscription = self.broadcaster.subscribe(order.id);
        let order = self.store.get(order.id).await?;
        Ok((order, subscription))
    }
}
