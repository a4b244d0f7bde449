use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::domain::model::{Subscriber, SubscriberKind};
use crate::ports::repo::Repo;

use super::{AdminError, AdminState};

#[derive(Debug, Deserialize)]
pub struct SubscriberSpec {
    pub kind: String,
    #[serde(default)]
    pub endpoint: String,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub async fn list_subscribers(
    State(state): State<AdminState>,
) -> Result<Json<Vec<Subscriber>>, AdminError> {
    let subscribers = state
        .repo
        .list_subscribers()
        .await
        .map_err(AdminError::internal)?;
    Ok(Json(subscribers))
}

pub async fn upsert_subscriber(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(spec): Json<SubscriberSpec>,
) -> Result<(StatusCode, Json<Subscriber>), AdminError> {
    let kind = match spec.kind.to_ascii_lowercase().as_str() {
        "webhook" => SubscriberKind::Webhook,
        "websocket" => SubscriberKind::Websocket,
        "email" => SubscriberKind::Email,
        other => {
            return Err(AdminError::invalid(format!(
                "unknown subscriber kind '{other}'"
            )))
        }
    };

    let existing = state
        .repo
        .list_subscribers()
        .await
        .map_err(AdminError::internal)?
        .into_iter()
        .any(|s| s.id == id);

    let subscriber = Subscriber {
        id,
        kind,
        endpoint: spec.endpoint,
        timeout_ms: spec.timeout_ms,
        max_retries: spec.max_retries,
        enabled: spec.enabled,
    };
    subscriber.validate().map_err(AdminError::invalid)?;

    state
        .repo
        .upsert_subscriber(&subscriber)
        .await
        .map_err(AdminError::internal)?;

    let status = if existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(subscriber)))
}

pub async fn delete_subscriber(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    let deleted = state
        .repo
        .delete_subscriber(&id)
        .await
        .map_err(AdminError::internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::not_found(format!("no subscriber '{id}'")))
    }
}
