//! Courier-side sampling loop.
//!
//! Runs on the courier's device (or a simulator) while an order is being
//! carried: read a fix, hand it to a sink, sleep for the interval plus a
//! bounded random jitter so a fleet of devices does not report in lockstep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::engine::tracker::PositionTracker;
use crate::error::AppError;
use crate::models::courier::{GeoPoint, PositionSample};

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn current_position(&self) -> Result<GeoPoint, LocationError>;
}

#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn submit(&self, sample: PositionSample) -> Result<(), AppError>;
}

#[async_trait]
impl PositionSink for PositionTracker {
    async fn submit(&self, sample: PositionSample) -> Result<(), AppError> {
        self.ingest(sample).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeedConfig {
    pub interval: Duration,
    pub max_jitter: Duration,
}

impl From<&Config> for FeedConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.tracking_interval,
            max_jitter: config.tracking_jitter,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub submitted: u64,
    pub missed: u64,
    pub rejected: u64,
}

fn next_delay(config: &FeedConfig) -> Duration {
    let jitter_ms = config.max_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return config.interval;
    }
    config.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

/// Samples until `cancel` fires. Nothing is submitted after cancellation is
/// observed, and a failed read leaves the previous position in place.
pub async fn run_position_feed(
    order_id: Uuid,
    courier_id: Uuid,
    source: Arc<dyn LocationSource>,
    sink: Arc<dyn PositionSink>,
    config: FeedConfig,
    cancel: CancellationToken,
) -> FeedStats {
    info!(order_id = %order_id, courier_id = %courier_id, "position feed started");
    let mut stats = FeedStats::default();

    loop {
        let fix = tokio::select! {
            _ = cancel.cancelled() => break,
            fix = source.current_position() => fix,
        };

        match fix {
            Ok(point) if !cancel.is_cancelled() => {
                let sample = PositionSample {
                    order_id,
                    courier_id,
                    point,
                    recorded_at: Utc::now(),
                };
                match sink.submit(sample).await {
                    Ok(()) => stats.submitted += 1,
                    Err(err) => {
                        stats.rejected += 1;
                        debug!(order_id = %order_id, error = %err, "position upload failed");
                    }
                }
            }
            Ok(_) => break,
            Err(err) => {
                stats.missed += 1;
                debug!(order_id = %order_id, error = %err, "position read failed");
            }
        }

        let delay = next_delay(&config);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(
        order_id = %order_id,
        submitted = stats.submitted,
        missed = stats.missed,
        "position feed stopped"
    );
    stats
}
