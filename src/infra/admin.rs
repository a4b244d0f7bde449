//! Admin HTTP surface: target and subscriber CRUD, force-poll and
//! reconcile triggers, status, metrics, and the websocket event stream.
mod status;
mod subscribers;
mod targets;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::hub::EventHub;
use crate::app::scheduler::EngineCommand;
use crate::domain::model::AppConfig;
use crate::infra::metrics::Metrics;
use crate::infra::sqlite_repo::SqliteRepo;

#[derive(Clone)]
pub struct AdminState {
    pub repo: Arc<SqliteRepo>,
    pub commands: mpsc::Sender<EngineCommand>,
    pub hub: EventHub,
    pub metrics: Arc<Metrics>,
    pub cfg: Arc<AppConfig>,
}

#[derive(Debug)]
pub struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> axum::response::Response {
        (self.status, self.message).into_response()
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status::engine_status))
        .route("/metrics", get(status::metrics_text))
        .route("/reconcile", post(status::force_reconcile))
        .route("/events/ws", get(status::events_ws))
        .route("/targets", get(targets::list_targets))
        .route(
            "/targets/:id",
            put(targets::upsert_target).delete(targets::delete_target),
        )
        .route("/targets/:id/poll", post(targets::force_poll))
        .route("/subscribers", get(subscribers::list_subscribers))
        .route(
            "/subscribers/:id",
            put(subscribers::upsert_subscriber).delete(subscribers::delete_subscriber),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

pub async fn serve(
    state: AdminState,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("admin bind error: {e}"))?;
    info!(%addr, "Admin server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| format!("admin server error: {e}"))
}
