use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::broadcast::Broadcaster;
use crate::error::AppError;
use crate::models::courier::{PositionFix, PositionSample};
use crate::models::event::{PositionUpdate, TrackingEvent};
use crate::models::order::OrderStatus;
use crate::observability::metrics::Metrics;
use crate::store::{OrderStore, PositionWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    /// Older than (or as old as) the last accepted sample.
    Stale,
    /// No armed tracker for this order and courier.
    NotArmed,
}

impl SampleOutcome {
    fn label(&self) -> &'static str {
        match self {
            SampleOutcome::Accepted => "accepted",
            SampleOutcome::Stale => "stale",
            SampleOutcome::NotArmed => "not_armed",
        }
    }
}

struct Slot {
    courier_id: Uuid,
    latest: Option<PositionFix>,
    armed: bool,
}

/// Latest-position slot per tracked order.
///
/// Samples for one order are serialised through the slot mutex and ordered
/// by their own timestamp, so the newest fix wins regardless of arrival
/// order. Disarming takes the same mutex, which means no sample can be
/// published once [`PositionTracker::disarm`] has returned.
pub struct PositionTracker {
    store: Arc<dyn OrderStore>,
    broadcaster: Arc<Broadcaster>,
    slots: DashMap<Uuid, Arc<Mutex<Slot>>>,
    metrics: Metrics,
}

impl PositionTracker {
    pub fn new(store: Arc<dyn OrderStore>, broadcaster: Arc<Broadcaster>, metrics: Metrics) -> Self {
        Self {
            store,
            broadcaster,
            slots: DashMap::new(),
            metrics,
        }
    }

    /// Starts accepting samples from `courier_id`. Re-arming keeps the latest fix.
    pub fn arm(&self, order_id: Uuid, courier_id: Uuid, latest: Option<PositionFix>) {
        self.slots.entry(order_id).or_insert_with(|| {
            Arc::new(Mutex::new(Slot {
                courier_id,
                latest,
                armed: true,
            }))
        });
    }

    pub async fn disarm(&self, order_id: Uuid) {
        if let Some((_, slot)) = self.slots.remove(&order_id) {
            slot.lock().await.armed = false;
            debug!(order_id = %order_id, "position tracker disarmed");
        }
    }

    pub fn is_armed(&self, order_id: Uuid) -> bool {
        self.slots.contains_key(&order_id)
    }

    pub fn armed_count(&self) -> usize {
        self.slots.len()
    }

    pub async fn ingest(&self, sample: PositionSample) -> Result<SampleOutcome, AppError> {
        let outcome = self.apply(sample).await?;
        self.metrics
            .position_samples_total
            .with_label_values(&[outcome.label()])
            .inc();

        if outcome != SampleOutcome::Accepted {
            debug!(
                order_id = %sample.order_id,
                courier_id = %sample.courier_id,
                outcome = outcome.label(),
                "position sample dropped"
            );
        }
        Ok(outcome)
    }

    async fn apply(&self, sample: PositionSample) -> Result<SampleOutcome, AppError> {
        let Some(slot) = self
            .slots
            .get(&sample.order_id)
            .map(|entry| entry.value().clone())
        else {
            return Ok(SampleOutcome::NotArmed);
        };

        let mut slot = slot.lock().await;
        if !slot.armed || slot.courier_id != sample.courier_id {
            return Ok(SampleOutcome::NotArmed);
        }

        let fix = PositionFix::from(&sample);
        if slot
            .latest
            .is_some_and(|latest| latest.recorded_at >= fix.recorded_at)
        {
            return Ok(SampleOutcome::Stale);
        }

        match self
            .store
            .record_position(sample.order_id, sample.courier_id, fix)
            .await?
        {
            PositionWrite::Applied => {}
            PositionWrite::Rejected => return Ok(SampleOutcome::NotArmed),
        }

        slot.latest = Some(fix);
        self.broadcaster
            .publish(TrackingEvent::PositionUpdated(PositionUpdate {
                order_id: sample.order_id,
                lat: fix.lat,
                lng: fix.lng,
                recorded_at: fix.recorded_at,
            }));

        Ok(SampleOutcome::Accepted)
    }

    /// Re-arms every order that was mid-delivery when the process last stopped.
    pub async fn rehydrate(&self) -> Result<usize, AppError> {
        let mut armed = 0;
        for status in [OrderStatus::PickedUp, OrderStatus::Delivering] {
            for order in self.store.list_by_status(status).await? {
                if let Some(courier_id) = order.assigned_courier {
                    self.arm(order.id, courier_id, order.courier_position);
                    armed += 1;
                }
            }
        }

        info!(armed, "position trackers rehydrated");
        Ok(armed)
    }
}
