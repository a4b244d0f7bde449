use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::scheduler::EngineCommand;
use crate::domain::target::{
    url_host, AdaptivePolicy, PollingTarget, RateLimitPolicy, TargetRuntime,
    DEFAULT_TRACKED_FIELDS,
};
use crate::ports::repo::Repo;

use super::{AdminError, AdminState};

#[derive(Debug, Serialize)]
pub struct TargetSummary {
    pub id: String,
    pub url: String,
    pub enabled: bool,
    pub base_interval_seconds: u64,
    pub min_interval_seconds: u64,
    pub max_interval_seconds: u64,
    pub tracked_fields: Vec<String>,
    pub breaker: &'static str,
    pub change_rate: f64,
    pub consecutive_failures: u32,
    pub last_success_at_ms: Option<i64>,
    pub next_poll_at_ms: i64,
}

impl From<&PollingTarget> for TargetSummary {
    fn from(t: &PollingTarget) -> Self {
        Self {
            id: t.id.clone(),
            url: t.url.clone(),
            enabled: t.enabled,
            base_interval_seconds: t.base_interval_secs,
            min_interval_seconds: t.min_interval_secs,
            max_interval_seconds: t.max_interval_secs,
            tracked_fields: t.tracked_fields.clone(),
            breaker: t.runtime.breaker.phase.as_str(),
            change_rate: t.runtime.change_rate,
            consecutive_failures: t.runtime.consecutive_failures,
            last_success_at_ms: t.runtime.last_success_at_ms,
            next_poll_at_ms: t.runtime.next_poll_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetSpec {
    pub url: String,
    pub base_interval_seconds: Option<u64>,
    pub min_interval_seconds: Option<u64>,
    pub max_interval_seconds: Option<u64>,
    pub change_threshold: Option<f64>,
    pub stability_bonus: Option<f64>,
    pub activity_boost: Option<f64>,
    pub learning_window_hours: Option<u32>,
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub burst: Option<u32>,
    pub grace_period_seconds: Option<u64>,
    pub tracked_fields: Option<Vec<String>>,
    pub ignored_fields: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

pub async fn list_targets(
    State(state): State<AdminState>,
) -> Result<Json<Vec<TargetSummary>>, AdminError> {
    let targets = state
        .repo
        .list_targets()
        .await
        .map_err(AdminError::internal)?;
    Ok(Json(targets.iter().map(TargetSummary::from).collect()))
}

pub async fn upsert_target(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(spec): Json<TargetSpec>,
) -> Result<(StatusCode, Json<TargetSummary>), AdminError> {
    let existing = state
        .repo
        .get_target(&id)
        .await
        .map_err(AdminError::internal)?;
    let created = existing.is_none();

    let domain = url_host(&spec.url)
        .ok_or_else(|| AdminError::invalid(format!("target '{id}' url has no host")))?;

    // Updates keep the accumulated runtime state; registration starts fresh.
    let (runtime, prior) = match existing {
        Some(t) => (t.runtime.clone(), Some(t)),
        None => (TargetRuntime::default(), None),
    };
    let prior = prior.as_ref();

    let target = PollingTarget {
        id: id.clone(),
        url: spec.url,
        domain,
        base_interval_secs: spec
            .base_interval_seconds
            .or(prior.map(|t| t.base_interval_secs))
            .unwrap_or(300),
        min_interval_secs: spec
            .min_interval_seconds
            .or(prior.map(|t| t.min_interval_secs))
            .unwrap_or(60),
        max_interval_secs: spec
            .max_interval_seconds
            .or(prior.map(|t| t.max_interval_secs))
            .unwrap_or(3600),
        adaptive: AdaptivePolicy {
            change_threshold: spec
                .change_threshold
                .or(prior.map(|t| t.adaptive.change_threshold))
                .unwrap_or(3.0),
            stability_bonus: spec
                .stability_bonus
                .or(prior.map(|t| t.adaptive.stability_bonus))
                .unwrap_or(0.5),
            activity_boost: spec
                .activity_boost
                .or(prior.map(|t| t.adaptive.activity_boost))
                .unwrap_or(2.0),
            learning_window_hours: spec
                .learning_window_hours
                .or(prior.map(|t| t.adaptive.learning_window_hours))
                .unwrap_or(24),
        },
        rate_limit: RateLimitPolicy {
            per_minute: spec
                .per_minute
                .or(prior.map(|t| t.rate_limit.per_minute))
                .unwrap_or(10),
            per_hour: spec
                .per_hour
                .or(prior.map(|t| t.rate_limit.per_hour))
                .unwrap_or(200),
            burst: spec.burst.or(prior.map(|t| t.rate_limit.burst)).unwrap_or(2),
        },
        tracked_fields: spec
            .tracked_fields
            .or(prior.map(|t| t.tracked_fields.clone()))
            .unwrap_or_else(|| DEFAULT_TRACKED_FIELDS.iter().map(|s| s.to_string()).collect()),
        ignored_fields: spec
            .ignored_fields
            .or(prior.map(|t| t.ignored_fields.clone()))
            .unwrap_or_default(),
        grace_period_secs: spec
            .grace_period_seconds
            .or(prior.map(|t| t.grace_period_secs))
            .unwrap_or(300),
        enabled: spec.enabled,
        runtime,
    };

    target.validate().map_err(AdminError::invalid)?;
    state
        .repo
        .upsert_target(&target)
        .await
        .map_err(AdminError::internal)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(TargetSummary::from(&target))))
}

pub async fn delete_target(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    let deleted = state
        .repo
        .delete_target(&id)
        .await
        .map_err(AdminError::internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AdminError::not_found(format!("no target '{id}'")))
    }
}

pub async fn force_poll(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AdminError> {
    let exists = state
        .repo
        .get_target(&id)
        .await
        .map_err(AdminError::internal)?
        .is_some();
    if !exists {
        return Err(AdminError::not_found(format!("no target '{id}'")));
    }
    state
        .commands
        .send(EngineCommand::ForcePoll(id))
        .await
        .map_err(|_| AdminError::internal("scheduler is not running"))?;
    Ok(StatusCode::ACCEPTED)
}
