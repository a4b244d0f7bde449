//! Minimal Prometheus text exposition for internal runtime stats. The
//! counters live on the engine and are served from the admin router.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct Metrics {
    start_time_seconds: u64,
    pub polls_ok: AtomicU64,
    pub polls_err: AtomicU64,
    pub polls_rate_limited: AtomicU64,
    pub fast_path_hits: AtomicU64,
    pub events_created: AtomicU64,
    pub events_updated: AtomicU64,
    pub events_removed: AtomicU64,
    pub deliveries_ok: AtomicU64,
    pub deliveries_err: AtomicU64,
    pub dead_letters: AtomicU64,
    pub inflight_polls: AtomicI64,
    pub breakers_open: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        let start_time_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            start_time_seconds,
            polls_ok: AtomicU64::new(0),
            polls_err: AtomicU64::new(0),
            polls_rate_limited: AtomicU64::new(0),
            fast_path_hits: AtomicU64::new(0),
            events_created: AtomicU64::new(0),
            events_updated: AtomicU64::new(0),
            events_removed: AtomicU64::new(0),
            deliveries_ok: AtomicU64::new(0),
            deliveries_err: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            inflight_polls: AtomicI64::new(0),
            breakers_open: AtomicI64::new(0),
        }
    }

    pub fn poll_started(&self) -> InFlightGuard<'_> {
        self.inflight_polls.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { metrics: self }
    }

    pub fn record_event_emitted(&self, event_type: crate::domain::event::EventType) {
        use crate::domain::event::EventType;
        let counter = match event_type {
            EventType::Created => &self.events_created,
            EventType::Updated => &self.events_updated,
            EventType::Removed => &self.events_removed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Prometheus text format; outbox depth rides in from the caller since
    /// it is a live store query.
    pub fn render(&self, outbox_depth: &[(String, i64)]) -> String {
        let mut out = String::new();
        let mut gauge = |name: &str, help: &str, value: i64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        };
        gauge(
            "listwatch_start_time_seconds",
            "Unix time the process started",
            self.start_time_seconds as i64,
        );
        gauge(
            "listwatch_inflight_polls",
            "Poll tasks currently running",
            self.inflight_polls.load(Ordering::Relaxed),
        );
        gauge(
            "listwatch_breakers_open",
            "Targets with an open circuit breaker",
            self.breakers_open.load(Ordering::Relaxed),
        );

        let counters = [
            ("listwatch_polls_ok_total", "Successful polls", &self.polls_ok),
            ("listwatch_polls_err_total", "Failed polls", &self.polls_err),
            (
                "listwatch_polls_rate_limited_total",
                "Polls deferred by the rate limiter",
                &self.polls_rate_limited,
            ),
            (
                "listwatch_fast_path_hits_total",
                "Polls short-circuited by the first-page fast path",
                &self.fast_path_hits,
            ),
            (
                "listwatch_events_created_total",
                "CREATED events emitted",
                &self.events_created,
            ),
            (
                "listwatch_events_updated_total",
                "UPDATED events emitted",
                &self.events_updated,
            ),
            (
                "listwatch_events_removed_total",
                "REMOVED events emitted",
                &self.events_removed,
            ),
            (
                "listwatch_deliveries_ok_total",
                "Successful subscriber deliveries",
                &self.deliveries_ok,
            ),
            (
                "listwatch_deliveries_err_total",
                "Failed subscriber deliveries",
                &self.deliveries_err,
            ),
            (
                "listwatch_dead_letters_total",
                "Events parked after exhausting retries",
                &self.dead_letters,
            ),
        ];
        for (name, help, counter) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        out.push_str(
            "# HELP listwatch_outbox_events Events in the outbox by status\n# TYPE listwatch_outbox_events gauge\n",
        );
        for (status, count) in outbox_depth {
            out.push_str(&format!(
                "listwatch_outbox_events{{status=\"{status}\"}} {count}\n"
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InFlightGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_polls.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters_and_outbox() {
        let m = Metrics::new();
        m.polls_ok.fetch_add(3, Ordering::Relaxed);
        let text = m.render(&[("PENDING".to_string(), 7)]);
        assert!(text.contains("listwatch_polls_ok_total 3"));
        assert!(text.contains("listwatch_outbox_events{status=\"PENDING\"} 7"));
    }

    #[test]
    fn inflight_guard_balances_on_drop() {
        let m = Metrics::new();
        {
            let _g = m.poll_started();
            assert_eq!(m.inflight_polls.load(Ordering::Relaxed), 1);
        }
        assert_eq!(m.inflight_polls.load(Ordering::Relaxed), 0);
    }
}
