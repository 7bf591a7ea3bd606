use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use delivery_tracker::api;
use delivery_tracker::config::{Config, LogFormat};
use delivery_tracker::engine::sweeper::run_stale_sweeper;
use delivery_tracker::error::AppError;
use delivery_tracker::state::AppState;

fn init_tracing(config: &Config) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);

    match config.log_format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let http_port = config.http_port;
    let sweep_every = config.stale_sweep_interval;
    let shared_state = Arc::new(AppState::new(config));

    shared_state.tracker.rehydrate().await?;

    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(run_stale_sweeper(
        shared_state.clone(),
        sweep_every,
        cancel.clone(),
    ));

    let app = api::rest::router(shared_state);

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    cancel.cancel();
    if let Err(err) = sweeper.await {
        tracing::error!(error = %err, "stale sweeper panicked");
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    cancel.cancel();
}
