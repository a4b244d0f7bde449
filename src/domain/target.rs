use serde::{Deserialize, Serialize};

use crate::domain::breaker::CircuitBreaker;

pub const DEFAULT_TRACKED_FIELDS: [&str; 4] = ["title", "price", "condition", "location"];

/// Change-rate driven interval tuning for a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptivePolicy {
    /// Changes per hour above which the target is considered active.
    pub change_threshold: f64,
    /// Factor in `(0, 1]`; quiet targets are stretched to
    /// `base / stability_bonus`, so smaller values mean less polling.
    pub stability_bonus: f64,
    /// Divisor (>= 1) applied to the base interval for active targets.
    pub activity_boost: f64,
    /// Hours of change history the rate is averaged over.
    pub learning_window_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub per_minute: u32,
    pub per_hour: u32,
    pub burst: u32,
}

/// Mutable per-target state carried across polls and persisted with the row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetRuntime {
    pub last_polled_at_ms: Option<i64>,
    pub last_success_at_ms: Option<i64>,
    pub next_poll_at_ms: i64,
    pub consecutive_failures: u32,
    pub breaker: CircuitBreaker,
    pub change_rate: f64,
    /// Epoch-ms stamps of detected changes, trimmed to the retention window.
    pub change_history_ms: Vec<i64>,
    /// Listing-id set of the most recent first page, for the fast path.
    pub first_page_ids: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingTarget {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub base_interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub adaptive: AdaptivePolicy,
    pub rate_limit: RateLimitPolicy,
    pub tracked_fields: Vec<String>,
    pub ignored_fields: Vec<String>,
    pub grace_period_secs: u64,
    pub enabled: bool,
    pub runtime: TargetRuntime,
}

impl PollingTarget {
    /// Canonical grouping key for this target's listings.
    pub fn source(&self) -> &str {
        &self.url
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("target id cannot be empty".into());
        }
        if url_host(&self.url).is_none() {
            return Err(format!("target '{}' url has no host", self.id));
        }
        if !(self.min_interval_secs <= self.base_interval_secs
            && self.base_interval_secs <= self.max_interval_secs)
        {
            return Err(format!(
                "target '{}' intervals must satisfy min <= base <= max",
                self.id
            ));
        }
        if self.min_interval_secs == 0 {
            return Err(format!("target '{}' min interval must be positive", self.id));
        }
        if !(self.adaptive.stability_bonus > 0.0 && self.adaptive.stability_bonus <= 1.0) {
            return Err(format!(
                "target '{}' stability_bonus must be in (0, 1]",
                self.id
            ));
        }
        if self.adaptive.activity_boost < 1.0 {
            return Err(format!(
                "target '{}' activity_boost must be >= 1",
                self.id
            ));
        }
        if self.adaptive.learning_window_hours == 0 {
            return Err(format!(
                "target '{}' learning_window_hours must be positive",
                self.id
            ));
        }
        if self.rate_limit.per_minute == 0 || self.rate_limit.per_hour == 0 {
            return Err(format!(
                "target '{}' rate limits must be positive",
                self.id
            ));
        }
        if self.rate_limit.burst == 0 {
            return Err(format!("target '{}' burst must be at least 1", self.id));
        }
        if self.tracked_fields.is_empty() {
            return Err(format!(
                "target '{}' must track at least one field",
                self.id
            ));
        }
        Ok(())
    }
}

/// Minimal host extraction; targets are validated with it so the rate
/// limiter always has a domain key.
pub fn url_host(url: &str) -> Option<String> {
    let u = url.trim();
    let after_scheme = u.split("://").nth(1)?;
    let host_port = after_scheme.split('/').next()?;
    let host = host_port.split('@').last().unwrap_or(host_port);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> PollingTarget {
        PollingTarget {
            id: "t1".into(),
            url: "https://market.example.com/search?q=laptop".into(),
            domain: "market.example.com".into(),
            base_interval_secs: 300,
            min_interval_secs: 60,
            max_interval_secs: 3600,
            adaptive: AdaptivePolicy {
                change_threshold: 3.0,
                stability_bonus: 0.5,
                activity_boost: 2.0,
                learning_window_hours: 24,
            },
            rate_limit: RateLimitPolicy {
                per_minute: 10,
                per_hour: 100,
                burst: 2,
            },
            tracked_fields: DEFAULT_TRACKED_FIELDS.iter().map(|s| s.to_string()).collect(),
            ignored_fields: vec![],
            grace_period_secs: 300,
            enabled: true,
            runtime: TargetRuntime::default(),
        }
    }

    #[test]
    fn valid_target_passes() {
        assert!(target().validate().is_ok());
    }

    #[test]
    fn interval_ordering_is_enforced() {
        let mut t = target();
        t.min_interval_secs = 600;
        assert!(t.validate().is_err());
    }

    #[test]
    fn stability_bonus_above_one_is_rejected() {
        let mut t = target();
        t.adaptive.stability_bonus = 1.5;
        assert!(t.validate().is_err());
    }

    #[test]
    fn url_host_strips_port_and_path() {
        assert_eq!(
            url_host("https://Market.Example.com:8443/a/b?c=d"),
            Some("market.example.com".to_string())
        );
        assert_eq!(url_host("not a url"), None);
    }
}
