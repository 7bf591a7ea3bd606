use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::state::AppState;

/// Periodically flags stale pool entries and drops dead tracking channels.
pub async fn run_stale_sweeper(state: Arc<AppState>, every: Duration, cancel: CancellationToken) {
    info!(every_secs = every.as_secs(), "stale sweeper started");

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => sweep(&state).await,
        }
    }

    info!("stale sweeper stopped");
}

pub async fn sweep(state: &AppState) {
    match state.pool.flag_stale(Utc::now()).await {
        Ok(flagged) if !flagged.is_empty() => {
            info!(count = flagged.len(), "orders flagged for follow-up");
        }
        Ok(_) => {}
        Err(err) => error!(error = %err, "stale sweep failed"),
    }

    let collected = state.broadcaster.collect_garbage();
    if collected > 0 {
        debug!(collected, "dropped idle tracking channels");
    }
}
