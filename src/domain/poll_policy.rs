//! Adaptive interval computation for a single target: change-rate boosts,
//! stability stretching, off-peak and open-breaker multipliers, and the
//! error backoff added after consecutive failures.
use chrono::{TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::domain::breaker::BreakerPhase;
use crate::domain::model::PeakHours;
use crate::domain::target::PollingTarget;

const CHANGE_HISTORY_RETENTION_MS: i64 = 24 * 3600 * 1000;
const ERROR_BACKOFF_BASE_SECS: u64 = 1;
const ERROR_BACKOFF_CAP_SECS: u64 = 300;

/// Seconds until the target should next be polled. Always clamped into
/// `[min_interval, max_interval]`.
pub fn next_interval_secs(target: &PollingTarget, now_ms: i64, tz: &Tz, peak: &PeakHours) -> u64 {
    let base = target.base_interval_secs as f64;
    let rate = target.runtime.change_rate;
    let adaptive = &target.adaptive;

    let mut interval = if rate > adaptive.change_threshold {
        (base / adaptive.activity_boost).max(target.min_interval_secs as f64)
    } else if rate == 0.0 && target.runtime.consecutive_failures == 0 {
        // Quiet and healthy: poll less often.
        (base / adaptive.stability_bonus).min(target.max_interval_secs as f64)
    } else {
        base
    };

    if !is_peak_hours(now_ms, tz, peak) {
        interval = (interval * 1.5).min(target.max_interval_secs as f64);
    }
    if target.runtime.breaker.phase == BreakerPhase::Open {
        interval = (interval * 2.0).min(target.max_interval_secs as f64);
    }

    (interval.round() as u64).clamp(target.min_interval_secs, target.max_interval_secs)
}

/// Extra delay stacked on top of the adaptive interval after failures:
/// `min(1s * 2^min(n, 4), 5min)`.
pub fn error_backoff_secs(consecutive_failures: u32) -> u64 {
    if consecutive_failures == 0 {
        return 0;
    }
    let exp = consecutive_failures.min(4);
    (ERROR_BACKOFF_BASE_SECS << exp).min(ERROR_BACKOFF_CAP_SECS)
}

pub fn is_peak_hours(now_ms: i64, tz: &Tz, peak: &PeakHours) -> bool {
    let hour = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
        .with_timezone(tz)
        .hour();
    if peak.start_hour <= peak.end_hour {
        (peak.start_hour..peak.end_hour).contains(&hour)
    } else {
        // Window wraps midnight, e.g. 22..6.
        hour >= peak.start_hour || hour < peak.end_hour
    }
}

/// Changes per hour averaged over the learning window.
pub fn change_rate(history_ms: &[i64], now_ms: i64, learning_window_hours: u32) -> f64 {
    let window_ms = i64::from(learning_window_hours) * 3600 * 1000;
    let cutoff = now_ms - window_ms;
    let recent = history_ms.iter().filter(|&&t| t > cutoff).count();
    recent as f64 / f64::from(learning_window_hours)
}

/// Drops change-history entries older than the retention cap.
pub fn trim_change_history(history_ms: &mut Vec<i64>, now_ms: i64) {
    let cutoff = now_ms - CHANGE_HISTORY_RETENTION_MS;
    history_ms.retain(|&t| t > cutoff);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::target::{AdaptivePolicy, PollingTarget, RateLimitPolicy, TargetRuntime};

    fn peak_all_day() -> PeakHours {
        PeakHours {
            start_hour: 0,
            end_hour: 24,
        }
    }

    fn target() -> PollingTarget {
        PollingTarget {
            id: "t1".into(),
            url: "https://market.example.com/search".into(),
            domain: "market.example.com".into(),
            base_interval_secs: 600,
            min_interval_secs: 60,
            max_interval_secs: 3600,
            adaptive: AdaptivePolicy {
                change_threshold: 3.0,
                stability_bonus: 0.5,
                activity_boost: 2.0,
                learning_window_hours: 1,
            },
            rate_limit: RateLimitPolicy {
                per_minute: 10,
                per_hour: 100,
                burst: 1,
            },
            tracked_fields: vec!["title".into(), "price".into()],
            ignored_fields: vec![],
            grace_period_secs: 300,
            enabled: true,
            runtime: TargetRuntime::default(),
        }
    }

    #[test]
    fn active_targets_poll_faster() {
        let mut t = target();
        t.runtime.change_rate = 5.0;
        let secs = next_interval_secs(&t, 0, &chrono_tz::UTC, &peak_all_day());
        assert_eq!(secs, 300);
    }

    #[test]
    fn quiet_targets_poll_slower() {
        let mut t = target();
        t.runtime.change_rate = 0.0;
        let secs = next_interval_secs(&t, 0, &chrono_tz::UTC, &peak_all_day());
        assert_eq!(secs, 1200);
    }

    #[test]
    fn quiet_but_failing_targets_keep_base() {
        let mut t = target();
        t.runtime.change_rate = 0.0;
        t.runtime.consecutive_failures = 2;
        let secs = next_interval_secs(&t, 0, &chrono_tz::UTC, &peak_all_day());
        assert_eq!(secs, 600);
    }

    #[test]
    fn interval_is_always_clamped() {
        let mut t = target();
        t.base_interval_secs = 3600;
        t.runtime.change_rate = 0.0;
        let secs = next_interval_secs(&t, 0, &chrono_tz::UTC, &peak_all_day());
        assert_eq!(secs, t.max_interval_secs);

        t.base_interval_secs = 60;
        t.runtime.change_rate = 100.0;
        let secs = next_interval_secs(&t, 0, &chrono_tz::UTC, &peak_all_day());
        assert_eq!(secs, t.min_interval_secs);
    }

    #[test]
    fn off_peak_stretches_interval() {
        let t = target();
        let peak = PeakHours {
            start_hour: 8,
            end_hour: 20,
        };
        // 1970-01-01T03:00 UTC is off-peak.
        let off_peak_ms = 3 * 3600 * 1000;
        let secs = next_interval_secs(&t, off_peak_ms, &chrono_tz::UTC, &peak);
        assert_eq!(secs, 900);
    }

    #[test]
    fn open_breaker_doubles_interval() {
        use crate::domain::breaker::BreakerPhase;
        let mut t = target();
        t.runtime.change_rate = 1.0;
        t.runtime.breaker.phase = BreakerPhase::Open;
        let secs = next_interval_secs(&t, 0, &chrono_tz::UTC, &peak_all_day());
        assert_eq!(secs, 1200);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(error_backoff_secs(0), 0);
        assert_eq!(error_backoff_secs(1), 2);
        assert_eq!(error_backoff_secs(2), 4);
        assert_eq!(error_backoff_secs(4), 16);
        assert_eq!(error_backoff_secs(10), 16);
    }

    #[test]
    fn change_rate_counts_window_entries() {
        let now = 10 * 3600 * 1000;
        let history = vec![now - 10_000, now - 20_000, now - 2 * 3600 * 1000];
        assert_eq!(change_rate(&history, now, 1), 2.0);
    }

    #[test]
    fn history_trims_to_retention() {
        let now = 48 * 3600 * 1000;
        let mut history = vec![now - 1000, now - 25 * 3600 * 1000];
        trim_change_history(&mut history, now);
        assert_eq!(history, vec![now - 1000]);
    }

    #[test]
    fn peak_window_wraps_midnight() {
        let peak = PeakHours {
            start_hour: 22,
            end_hour: 6,
        };
        let at = |h: i64| h * 3600 * 1000;
        assert!(is_peak_hours(at(23), &chrono_tz::UTC, &peak));
        assert!(is_peak_hours(at(3), &chrono_tz::UTC, &peak));
        assert!(!is_peak_hours(at(12), &chrono_tz::UTC, &peak));
    }
}
