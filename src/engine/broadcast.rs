//! Per-order fan-out of tracking events plus a single all-orders dispatcher
//! feed.
//!
//! Each order gets its own `broadcast` channel, created lazily by the first
//! subscriber. Channels are removed when the last [`Subscription`] drops,
//! when a publish finds nobody listening, or when the order reaches a
//! terminal state, which ends every open stream for it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

use crate::models::event::{DispatchEvent, TrackingEvent};
use crate::observability::metrics::Metrics;

type Channels = Arc<DashMap<Uuid, broadcast::Sender<TrackingEvent>>>;

pub struct Broadcaster {
    channels: Channels,
    dispatch_tx: broadcast::Sender<DispatchEvent>,
    capacity: usize,
    metrics: Metrics,
}

impl Broadcaster {
    pub fn new(capacity: usize, dispatch_capacity: usize, metrics: Metrics) -> Self {
        let (dispatch_tx, _unused_rx) = broadcast::channel(dispatch_capacity);

        Self {
            channels: Arc::new(DashMap::new()),
            dispatch_tx,
            capacity,
            metrics,
        }
    }

    /// Opens a stream for one order. Callers resolve the tracking token first.
    pub fn subscribe(&self, order_id: Uuid) -> Subscription {
        let rx = self
            .channels
            .entry(order_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        self.metrics.active_subscriptions.inc();

        Subscription {
            order_id,
            rx,
            channels: self.channels.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Returns the number of observers the event reached.
    pub fn publish(&self, event: TrackingEvent) -> usize {
        let order_id = event.order_id();
        let delivered = match self.channels.get(&order_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => return 0,
        };

        if delivered == 0 {
            self.channels
                .remove_if(&order_id, |_, tx| tx.receiver_count() == 0);
        }
        delivered
    }

    /// Drops the order's channel so open streams finish after draining.
    pub fn close(&self, order_id: Uuid) {
        if self.channels.remove(&order_id).is_some() {
            debug!(order_id = %order_id, "tracking channel closed");
        }
    }

    pub fn dispatch(&self, event: DispatchEvent) {
        let _ = self.dispatch_tx.send(event);
    }

    pub fn subscribe_dispatch(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatch_tx.subscribe()
    }

    /// Removes channels whose observers have all gone away.
    pub fn collect_garbage(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn observers(&self, order_id: Uuid) -> usize {
        self.channels
            .get(&order_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

pub struct Subscription {
    order_id: Uuid,
    rx: broadcast::Receiver<TrackingEvent>,
    channels: Channels,
    metrics: Metrics,
}

impl Subscription {
    /// Next event, or `None` once the order's channel has closed. Lagging
    /// observers skip ahead rather than fail.
    pub async fn recv(&mut self) -> Option<TrackingEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(order_id = %self.order_id, skipped, "tracking observer lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<TrackingEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.metrics.active_subscriptions.dec();
        // Our own receiver is still alive here.
        self.channels
            .remove_if(&self.order_id, |_, tx| tx.receiver_count() <= 1);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::event::PositionUpdate;

    fn position(order_id: Uuid, lat: f64, lng: f64) -> TrackingEvent {
        TrackingEvent::PositionUpdated(PositionUpdate {
            order_id,
            lat,
            lng,
            recorded_at: Utc::now(),
        })
    }

    fn broadcaster() -> Broadcaster {
        Broadcaster::new(16, 16, Metrics::new())
    }

    #[tokio::test]
    async fn every_observer_of_an_order_receives_its_events() {
        let hub = broadcaster();
        let order_id = Uuid::new_v4();
        let mut first = hub.subscribe(order_id);
        let mut second = hub.subscribe(order_id);

        assert_eq!(hub.publish(position(order_id, 13.75, 100.5)), 2);

        for sub in [&mut first, &mut second] {
            match sub.recv().await {
                Some(TrackingEvent::PositionUpdated(update)) => {
                    assert_eq!(update.order_id, order_id);
                    assert_eq!((update.lat, update.lng), (13.75, 100.5));
                }
                other => panic!("expected position update, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn observers_only_see_their_own_order() {
        let hub = broadcaster();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut sub = hub.subscribe(mine);
        let _other_sub = hub.subscribe(other);

        hub.publish(position(other, 1.0, 1.0));

        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_last_subscription_removes_channel() {
        let hub = broadcaster();
        let order_id = Uuid::new_v4();
        let first = hub.subscribe(order_id);
        let second = hub.subscribe(order_id);

        assert_eq!(hub.observers(order_id), 2);

        drop(first);
        assert_eq!(hub.open_channels(), 1);
        assert_eq!(hub.observers(order_id), 1);
        drop(second);
        assert_eq!(hub.open_channels(), 0);
        assert_eq!(hub.observers(order_id), 0);
        assert_eq!(hub.metrics.active_subscriptions.get(), 0);
    }

    #[tokio::test]
    async fn close_ends_open_streams_after_draining() {
        let hub = broadcaster();
        let order_id = Uuid::new_v4();
        let mut sub = hub.subscribe(order_id);

        hub.publish(position(order_id, 13.75, 100.5));
        hub.close(order_id);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_observers_is_a_no_op() {
        let hub = broadcaster();
        assert_eq!(hub.publish(position(Uuid::new_v4(), 0.0, 0.0)), 0);
        assert_eq!(hub.open_channels(), 0);
    }
}
