//! Loads the TOML configuration bundle (app/targets/subscribers), applies
//! environment overrides, and normalizes everything into `AppConfig` plus
//! validated seed targets and subscribers.
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::Deserialize;
use tokio::fs;

use crate::domain::model::{
    AppConfig, AppMode, CacheConfig, DispatcherConfig, PeakHours, SchedulerConfig, Subscriber,
    SubscriberKind,
};
use crate::domain::target::{
    url_host, AdaptivePolicy, PollingTarget, RateLimitPolicy, TargetRuntime,
    DEFAULT_TRACKED_FIELDS,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct RawAppFile {
    app: RawApp,
    store: RawStore,
    #[serde(default)]
    cache: RawCache,
    scheduler: RawScheduler,
    dispatcher: RawDispatcher,
    admin: RawAdmin,
    logging: RawLogging,
    #[serde(default)]
    webhook: RawWebhook,
    requests: RawRequests,
    #[serde(default)]
    diff: RawDiff,
    #[serde(default)]
    target_defaults: RawTargetDefaults,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    mode: Option<String>,
    timezone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStore {
    path: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawCache {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawScheduler {
    poll_interval_ms: u64,
    max_concurrent_polls: usize,
    #[serde(default = "default_drain_deadline")]
    drain_deadline_seconds: u64,
    #[serde(default = "default_watchdog_interval")]
    watchdog_interval_seconds: u64,
    #[serde(default = "default_poll_task_ceiling")]
    poll_task_ceiling_seconds: u64,
    #[serde(default = "default_reconcile_hours")]
    reconcile_interval_hours: u64,
    #[serde(default = "default_peak_start")]
    peak_start_hour: u32,
    #[serde(default = "default_peak_end")]
    peak_end_hour: u32,
}

#[derive(Debug, Deserialize)]
struct RawDispatcher {
    processing_interval_ms: u64,
    batch_size: i64,
    worker_count: usize,
    #[serde(default = "default_lease_seconds")]
    lease_seconds: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_delivery_timeout")]
    delivery_timeout_ms: u64,
    #[serde(default = "default_retry_base")]
    retry_base_ms: u64,
    #[serde(default = "default_retry_cap")]
    retry_cap_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RawAdmin {
    port: u16,
}

#[derive(Debug, Deserialize)]
struct RawLogging {
    level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawWebhook {
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRequests {
    user_agent: String,
    #[serde(default = "default_request_timeout")]
    timeout_seconds: u64,
    #[serde(default = "default_max_pages")]
    max_pages: u32,
}

#[derive(Debug, Deserialize, Default)]
struct RawDiff {
    min_significance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTargetDefaults {
    #[serde(default = "default_base_interval")]
    base_interval_seconds: u64,
    #[serde(default = "default_min_interval")]
    min_interval_seconds: u64,
    #[serde(default = "default_max_interval")]
    max_interval_seconds: u64,
    #[serde(default = "default_change_threshold")]
    change_threshold: f64,
    #[serde(default = "default_stability_bonus")]
    stability_bonus: f64,
    #[serde(default = "default_activity_boost")]
    activity_boost: f64,
    #[serde(default = "default_learning_window")]
    learning_window_hours: u32,
    #[serde(default = "default_per_minute")]
    per_minute: u32,
    #[serde(default = "default_per_hour")]
    per_hour: u32,
    #[serde(default = "default_burst")]
    burst: u32,
    #[serde(default = "default_grace_period")]
    grace_period_seconds: u64,
    #[serde(default)]
    tracked_fields: Option<Vec<String>>,
    #[serde(default)]
    ignored_fields: Vec<String>,
}

impl Default for RawTargetDefaults {
    fn default() -> Self {
        Self {
            base_interval_seconds: default_base_interval(),
            min_interval_seconds: default_min_interval(),
            max_interval_seconds: default_max_interval(),
            change_threshold: default_change_threshold(),
            stability_bonus: default_stability_bonus(),
            activity_boost: default_activity_boost(),
            learning_window_hours: default_learning_window(),
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            burst: default_burst(),
            grace_period_seconds: default_grace_period(),
            tracked_fields: None,
            ignored_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTargetsFile {
    #[serde(default)]
    targets: Vec<RawTarget>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    id: String,
    url: String,
    base_interval_seconds: Option<u64>,
    min_interval_seconds: Option<u64>,
    max_interval_seconds: Option<u64>,
    change_threshold: Option<f64>,
    stability_bonus: Option<f64>,
    activity_boost: Option<f64>,
    learning_window_hours: Option<u32>,
    per_minute: Option<u32>,
    per_hour: Option<u32>,
    burst: Option<u32>,
    grace_period_seconds: Option<u64>,
    tracked_fields: Option<Vec<String>>,
    #[serde(default)]
    ignored_fields: Option<Vec<String>>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawSubscribersFile {
    #[serde(default)]
    subscribers: Vec<RawSubscriber>,
}

#[derive(Debug, Deserialize)]
struct RawSubscriber {
    id: String,
    kind: String,
    #[serde(default)]
    endpoint: String,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

pub struct ConfigLoader;

pub struct LoadedConfig {
    pub app: AppConfig,
    pub targets: Vec<PollingTarget>,
    pub subscribers: Vec<Subscriber>,
}

impl ConfigLoader {
    pub async fn load(config_path: &Path) -> Result<LoadedConfig, ConfigError> {
        let base_dir = config_path
            .parent()
            .ok_or_else(|| ConfigError::Invalid("config path has no parent".into()))?;

        let app_content = fs::read_to_string(config_path).await?;
        let raw: RawAppFile = toml::from_str(&app_content)?;

        let mode = parse_mode(raw.app.mode.as_deref())?;
        let tz_str = raw
            .app
            .timezone
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("UTC");
        let timezone: Tz = tz_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid timezone '{tz_str}'")))?;

        let log_level = env_or("LOG_LEVEL", raw.logging.level)
            .unwrap_or_else(|| "info".to_string());
        let webhook_secret = env_or("WEBHOOK_SECRET", raw.webhook.secret);

        let store_path = PathBuf::from(
            std::env::var("STORE_PATH")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(raw.store.path),
        );
        let store_path = if store_path.is_absolute() {
            store_path
        } else {
            base_dir.join(store_path)
        };

        let max_concurrent_polls =
            env_parsed("MAX_CONCURRENT_POLLS", raw.scheduler.max_concurrent_polls)?;
        let poll_interval_ms = env_parsed("POLL_INTERVAL_MS", raw.scheduler.poll_interval_ms)?;
        let admin_port = env_parsed("ADMIN_PORT", raw.admin.port)?;

        if max_concurrent_polls == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_concurrent_polls must be positive".into(),
            ));
        }
        if raw.scheduler.peak_start_hour > 24 || raw.scheduler.peak_end_hour > 24 {
            return Err(ConfigError::Invalid(
                "scheduler peak hours must be within 0..=24".into(),
            ));
        }
        if raw.dispatcher.worker_count == 0 || raw.dispatcher.batch_size <= 0 {
            return Err(ConfigError::Invalid(
                "dispatcher worker_count and batch_size must be positive".into(),
            ));
        }

        let min_significance = raw
            .diff
            .min_significance
            .unwrap_or(crate::domain::diff::DEFAULT_MIN_SIGNIFICANCE);
        if !(0.0..=1.0).contains(&min_significance) {
            return Err(ConfigError::Invalid(format!(
                "diff.min_significance must be within [0, 1], got {min_significance}"
            )));
        }

        let cache = CacheConfig {
            host: env_or("REDIS_HOST", raw.cache.host),
            port: match std::env::var("REDIS_PORT") {
                Ok(v) if !v.is_empty() => Some(v.parse().map_err(|_| {
                    ConfigError::Invalid(format!("invalid REDIS_PORT '{v}'"))
                })?),
                _ => raw.cache.port,
            },
        };

        let app = AppConfig {
            mode,
            timezone,
            store_path,
            scheduler: SchedulerConfig {
                poll_interval_ms,
                max_concurrent_polls,
                drain_deadline_secs: raw.scheduler.drain_deadline_seconds,
                watchdog_interval_secs: raw.scheduler.watchdog_interval_seconds,
                poll_task_ceiling_secs: raw.scheduler.poll_task_ceiling_seconds,
                reconcile_interval_hours: raw.scheduler.reconcile_interval_hours,
                peak_hours: PeakHours {
                    start_hour: raw.scheduler.peak_start_hour,
                    end_hour: raw.scheduler.peak_end_hour,
                },
            },
            dispatcher: DispatcherConfig {
                processing_interval_ms: raw.dispatcher.processing_interval_ms,
                batch_size: raw.dispatcher.batch_size,
                worker_count: raw.dispatcher.worker_count,
                lease_ms: (raw.dispatcher.lease_seconds * 1000) as i64,
                max_retries: raw.dispatcher.max_retries,
                delivery_timeout_ms: raw.dispatcher.delivery_timeout_ms,
                retry_base_ms: raw.dispatcher.retry_base_ms,
                retry_cap_ms: raw.dispatcher.retry_cap_ms,
            },
            cache,
            admin_port,
            log_level,
            webhook_secret,
            user_agent: raw.requests.user_agent,
            request_timeout_secs: raw.requests.timeout_seconds,
            max_pages: raw.requests.max_pages,
            min_significance,
        };

        let targets = Self::load_targets(&base_dir.join("targets.toml"), &raw.target_defaults).await?;
        let subscribers = Self::load_subscribers(&base_dir.join("subscribers.toml")).await?;

        Ok(LoadedConfig {
            app,
            targets,
            subscribers,
        })
    }

    async fn load_targets(
        path: &Path,
        defaults: &RawTargetDefaults,
    ) -> Result<Vec<PollingTarget>, ConfigError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).await?;
        let parsed: RawTargetsFile = toml::from_str(&content)?;

        let mut seen = std::collections::HashSet::new();
        let mut targets = Vec::new();
        for t in parsed.targets {
            if !seen.insert(t.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate target id '{}'", t.id)));
            }
            let domain = url_host(&t.url)
                .ok_or_else(|| ConfigError::Invalid(format!("target '{}' url has no host", t.id)))?;
            let tracked_fields = t
                .tracked_fields
                .or_else(|| defaults.tracked_fields.clone())
                .unwrap_or_else(|| {
                    DEFAULT_TRACKED_FIELDS.iter().map(|s| s.to_string()).collect()
                });
            let target = PollingTarget {
                id: t.id,
                url: t.url,
                domain,
                base_interval_secs: t
                    .base_interval_seconds
                    .unwrap_or(defaults.base_interval_seconds),
                min_interval_secs: t
                    .min_interval_seconds
                    .unwrap_or(defaults.min_interval_seconds),
                max_interval_secs: t
                    .max_interval_seconds
                    .unwrap_or(defaults.max_interval_seconds),
                adaptive: AdaptivePolicy {
                    change_threshold: t.change_threshold.unwrap_or(defaults.change_threshold),
                    stability_bonus: t.stability_bonus.unwrap_or(defaults.stability_bonus),
                    activity_boost: t.activity_boost.unwrap_or(defaults.activity_boost),
                    learning_window_hours: t
                        .learning_window_hours
                        .unwrap_or(defaults.learning_window_hours),
                },
                rate_limit: RateLimitPolicy {
                    per_minute: t.per_minute.unwrap_or(defaults.per_minute),
                    per_hour: t.per_hour.unwrap_or(defaults.per_hour),
                    burst: t.burst.unwrap_or(defaults.burst),
                },
                tracked_fields,
                ignored_fields: t
                    .ignored_fields
                    .unwrap_or_else(|| defaults.ignored_fields.clone()),
                grace_period_secs: t
                    .grace_period_seconds
                    .unwrap_or(defaults.grace_period_seconds),
                enabled: t.enabled,
                runtime: TargetRuntime::default(),
            };
            target.validate().map_err(ConfigError::Invalid)?;
            targets.push(target);
        }
        Ok(targets)
    }

    async fn load_subscribers(path: &Path) -> Result<Vec<Subscriber>, ConfigError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path).await?;
        let parsed: RawSubscribersFile = toml::from_str(&content)?;

        let mut subscribers = Vec::new();
        for s in parsed.subscribers {
            let kind = match s.kind.to_ascii_lowercase().as_str() {
                "webhook" => SubscriberKind::Webhook,
                "websocket" => SubscriberKind::Websocket,
                "email" => SubscriberKind::Email,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "subscriber '{}' has unknown kind '{other}'",
                        s.id
                    )))
                }
            };
            let sub = Subscriber {
                id: s.id,
                kind,
                endpoint: s.endpoint,
                timeout_ms: s.timeout_ms,
                max_retries: s.max_retries,
                enabled: s.enabled,
            };
            sub.validate().map_err(ConfigError::Invalid)?;
            subscribers.push(sub);
        }
        Ok(subscribers)
    }
}

fn env_or(name: &str, fallback: Option<String>) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty()).or(fallback)
}

fn env_parsed<T>(name: &str, fallback: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid {name} '{v}'"))),
        _ => Ok(fallback),
    }
}

fn parse_mode(s: Option<&str>) -> Result<AppMode, ConfigError> {
    match s.map(|x| x.to_ascii_lowercase()) {
        None => Ok(AppMode::Prod),
        Some(m) if m == "prod" => Ok(AppMode::Prod),
        Some(m) if m == "dev" => Ok(AppMode::Dev),
        Some(other) => Err(ConfigError::Invalid(format!(
            "invalid app.mode '{other}', expected 'dev' or 'prod'"
        ))),
    }
}

fn default_drain_deadline() -> u64 {
    30
}
fn default_watchdog_interval() -> u64 {
    60
}
fn default_poll_task_ceiling() -> u64 {
    300
}
fn default_reconcile_hours() -> u64 {
    24
}
fn default_peak_start() -> u32 {
    8
}
fn default_peak_end() -> u32 {
    22
}
fn default_lease_seconds() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_delivery_timeout() -> u64 {
    10_000
}
fn default_retry_base() -> u64 {
    1_000
}
fn default_retry_cap() -> u64 {
    300_000
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_pages() -> u32 {
    20
}
fn default_base_interval() -> u64 {
    300
}
fn default_min_interval() -> u64 {
    60
}
fn default_max_interval() -> u64 {
    3600
}
fn default_change_threshold() -> f64 {
    3.0
}
fn default_stability_bonus() -> f64 {
    0.5
}
fn default_activity_boost() -> f64 {
    2.0
}
fn default_learning_window() -> u32 {
    24
}
fn default_per_minute() -> u32 {
    10
}
fn default_per_hour() -> u32 {
    200
}
fn default_burst() -> u32 {
    2
}
fn default_grace_period() -> u64 {
    300
}
fn default_enabled() -> bool {
    true
}
