use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures::SinkExt;
use futures::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::api::rest::tracking::{build_snapshot, TrackingSnapshot};
use crate::engine::broadcast::Subscription;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
enum Greeting<'a> {
    Snapshot(&'a TrackingSnapshot),
}

fn to_text<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Message::Text(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize event for ws");
            None
        }
    }
}

/// Waits for either half of a socket to finish, then aborts the other and
/// waits until it is gone, so a sender parked on a subscription releases it
/// as soon as the client leaves.
async fn run_until_either(mut send_task: JoinHandle<()>, mut recv_task: JoinHandle<()>) {
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            let _ = recv_task.await;
        }
        _ = &mut recv_task => {
            send_task.abort();
            let _ = send_task.await;
        }
    }
}

/// Every order's status changes, intake and staleness flags.
pub async fn dispatch_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_dispatch_socket(socket, state))
}

async fn handle_dispatch_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.broadcaster.subscribe_dispatch());

    info!("dispatcher connected");

    let send_task = tokio::spawn(async move {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    debug!(skipped, "dispatcher feed lagged");
                    continue;
                }
            };

            let Some(message) = to_text(&event) else {
                continue;
            };
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    run_until_either(send_task, recv_task).await;

    info!("dispatcher disconnected");
}

/// Customer stream for the order behind `token`. Unknown tokens are refused
/// before the upgrade.
pub async fn tracking_ws(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let (order, subscription) = state.open_tracking(&token).await?;
    let snapshot = build_snapshot(&state, &order).await?;
    let live = if order.status.is_terminal() {
        drop(subscription);
        None
    } else {
        Some(subscription)
    };

    Ok(ws.on_upgrade(move |socket| handle_tracking_socket(socket, snapshot, live)))
}

async fn handle_tracking_socket(
    socket: WebSocket,
    snapshot: TrackingSnapshot,
    live: Option<Subscription>,
) {
    let (mut sender, mut receiver) = socket.split();
    let order_id = snapshot.order_id;

    info!(order_id = %order_id, "tracking client connected");

    let send_task = tokio::spawn(async move {
        if let Some(message) = to_text(&Greeting::Snapshot(&snapshot)) {
            if sender.send(message).await.is_err() {
                return;
            }
        }

        if let Some(mut subscription) = live {
            while let Some(event) = subscription.recv().await {
                let Some(message) = to_text(&event) else {
                    continue;
                };
                if sender.send(message).await.is_err() {
                    return;
                }
            }
        }

        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    run_until_either(send_task, recv_task).await;

    info!(order_id = %order_id, "tracking client disconnected");
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::engine::broadcast::Broadcaster;
    use crate::observability::metrics::Metrics;

    #[tokio::test]
    async fn closed_client_releases_parked_subscription() {
        let metrics = Metrics::new();
        let broadcaster = Broadcaster::new(16, 16, metrics.clone());
        let order_id = Uuid::new_v4();
        let mut subscription = broadcaster.subscribe(order_id);
        assert_eq!(broadcaster.observers(order_id), 1);

        let send_task = tokio::spawn(async move { while subscription.recv().await.is_some() {} });
        let recv_task = tokio::spawn(async {});

        run_until_either(send_task, recv_task).await;

        assert_eq!(broadcaster.observers(order_id), 0);
        assert_eq!(broadcaster.open_channels(), 0);
        assert_eq!(metrics.active_subscriptions.get(), 0);
    }
}
