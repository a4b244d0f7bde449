use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::debug;

use crate::app::scheduler::EngineCommand;
use crate::ports::repo::Repo;

use super::targets::TargetSummary;
use super::{AdminError, AdminState};

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub mode: String,
    pub targets: Vec<TargetSummary>,
    pub outbox: Vec<OutboxDepth>,
    pub subscribers: usize,
    pub websocket_clients: usize,
}

#[derive(Debug, Serialize)]
pub struct OutboxDepth {
    pub status: String,
    pub count: i64,
}

pub async fn engine_status(
    State(state): State<AdminState>,
) -> Result<Json<EngineStatus>, AdminError> {
    let targets = state
        .repo
        .list_targets()
        .await
        .map_err(AdminError::internal)?;
    let outbox = state
        .repo
        .outbox_depth()
        .await
        .map_err(AdminError::internal)?;
    let subscribers = state
        .repo
        .list_subscribers()
        .await
        .map_err(AdminError::internal)?;

    Ok(Json(EngineStatus {
        mode: format!("{:?}", state.cfg.mode),
        targets: targets.iter().map(TargetSummary::from).collect(),
        outbox: outbox
            .into_iter()
            .map(|(status, count)| OutboxDepth { status, count })
            .collect(),
        subscribers: subscribers.len(),
        websocket_clients: state.hub.receiver_count(),
    }))
}

pub async fn metrics_text(State(state): State<AdminState>) -> Result<String, AdminError> {
    let outbox = state
        .repo
        .outbox_depth()
        .await
        .map_err(AdminError::internal)?;
    Ok(state.metrics.render(&outbox))
}

pub async fn force_reconcile(State(state): State<AdminState>) -> Result<StatusCode, AdminError> {
    state
        .commands
        .send(EngineCommand::Reconcile)
        .await
        .map_err(|_| AdminError::internal("scheduler is not running"))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn events_ws(
    State(state): State<AdminState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: AdminState) {
    let mut events = state.hub.subscribe();
    debug!("Websocket client connected");
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(body) => {
                    if socket.send(Message::Text(body)).await.is_err() {
                        break;
                    }
                }
                // Lagged receivers skip ahead; closed hub ends the stream.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Websocket client lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    debug!("Websocket client disconnected");
}
