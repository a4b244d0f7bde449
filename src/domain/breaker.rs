//! Per-target circuit breaker. The state snapshot is persisted with the
//! target so failure isolation survives restarts.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerPhase::Closed => "CLOSED",
            BreakerPhase::Open => "OPEN",
            BreakerPhase::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration_ms: i64,
    pub half_open_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 60_000,
            half_open_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub phase: BreakerPhase,
    pub failure_count: u32,
    pub opened_at_ms: Option<i64>,
    pub probe_successes: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failure_count: 0,
            opened_at_ms: None,
            probe_successes: 0,
        }
    }
}

impl CircuitBreaker {
    /// Whether a poll may go out now. Does not mutate; an elapsed OPEN window
    /// is reported as allowed and the caller moves the breaker to HALF_OPEN
    /// via [`CircuitBreaker::begin_probe`] before fetching.
    pub fn allows(&self, now_ms: i64, settings: &BreakerSettings) -> bool {
        match self.phase {
            BreakerPhase::Closed | BreakerPhase::HalfOpen => true,
            BreakerPhase::Open => {
                let opened = self.opened_at_ms.unwrap_or(now_ms);
                now_ms >= opened + settings.open_duration_ms
            }
        }
    }

    /// Transitions an elapsed OPEN breaker into HALF_OPEN. One poll per
    /// target is in flight at a time, so HALF_OPEN admits exactly one probe.
    pub fn begin_probe(&mut self, now_ms: i64, settings: &BreakerSettings) {
        if self.phase == BreakerPhase::Open && self.allows(now_ms, settings) {
            self.phase = BreakerPhase::HalfOpen;
            self.probe_successes = 0;
        }
    }

    /// Forces an OPEN breaker to HALF_OPEN, used by the reconciliation sweep
    /// to re-probe targets out of schedule.
    pub fn force_half_open(&mut self) {
        if self.phase == BreakerPhase::Open {
            self.phase = BreakerPhase::HalfOpen;
            self.probe_successes = 0;
        }
    }

    pub fn record_success(&mut self, settings: &BreakerSettings) {
        match self.phase {
            BreakerPhase::Closed => {
                // Drift the failure count back down instead of resetting it.
                self.failure_count = self.failure_count.saturating_sub(1);
            }
            BreakerPhase::HalfOpen => {
                self.probe_successes += 1;
                if self.probe_successes >= settings.half_open_probes {
                    self.phase = BreakerPhase::Closed;
                    self.failure_count = 0;
                    self.opened_at_ms = None;
                    self.probe_successes = 0;
                }
            }
            BreakerPhase::Open => {}
        }
    }

    pub fn record_failure(&mut self, now_ms: i64, settings: &BreakerSettings) {
        match self.phase {
            BreakerPhase::Closed => {
                self.failure_count += 1;
                if self.failure_count >= settings.failure_threshold {
                    self.phase = BreakerPhase::Open;
                    self.opened_at_ms = Some(now_ms);
                }
            }
            BreakerPhase::HalfOpen => {
                self.phase = BreakerPhase::Open;
                self.opened_at_ms = Some(now_ms);
                self.probe_successes = 0;
            }
            BreakerPhase::Open => {}
        }
    }
}
