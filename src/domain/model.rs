use std::path::PathBuf;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppMode {
    Dev,
    Prod,
}

/// Daily window during which the base polling cadence is kept; outside of it
/// intervals are stretched. Half-open `[start_hour, end_hour)` in the
/// operator timezone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeakHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub max_concurrent_polls: usize,
    pub drain_deadline_secs: u64,
    pub watchdog_interval_secs: u64,
    pub poll_task_ceiling_secs: u64,
    pub reconcile_interval_hours: u64,
    pub peak_hours: PeakHours,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub processing_interval_ms: u64,
    pub batch_size: i64,
    pub worker_count: usize,
    pub lease_ms: i64,
    pub max_retries: u32,
    pub delivery_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
}

/// Accepted for compatibility with deployments that front the store with an
/// external cache; this build serves lookups from an in-process cache and
/// only logs the configured endpoint.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: AppMode,
    pub timezone: Tz,
    pub store_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
    pub admin_port: u16,
    pub log_level: String,
    pub webhook_secret: Option<String>,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_pages: u32,
    pub min_significance: f64,
}

/// How a change event leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberKind {
    Webhook,
    Websocket,
    Email,
}

impl SubscriberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberKind::Webhook => "WEBHOOK",
            SubscriberKind::Websocket => "WEBSOCKET",
            SubscriberKind::Email => "EMAIL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WEBHOOK" => Some(SubscriberKind::Webhook),
            "WEBSOCKET" => Some(SubscriberKind::Websocket),
            "EMAIL" => Some(SubscriberKind::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub kind: SubscriberKind,
    pub endpoint: String,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub enabled: bool,
}

impl Subscriber {
    /// Synchronous registration-time validation; invalid subscribers are
    /// surfaced to the caller and never reach the outbox.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("subscriber id cannot be empty".into());
        }
        match self.kind {
            SubscriberKind::Webhook => {
                if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
                    return Err(format!(
                        "subscriber '{}' endpoint must be an http(s) url",
                        self.id
                    ));
                }
            }
            SubscriberKind::Websocket => {}
            SubscriberKind::Email => {
                return Err(format!(
                    "subscriber '{}': email delivery is not available in this build",
                    self.id
                ));
            }
        }
        Ok(())
    }
}
