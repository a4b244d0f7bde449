//! Per-domain request budgets: sliding per-minute and per-hour windows plus
//! a burst semaphore held for the duration of the outbound request.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};

use crate::domain::target::RateLimitPolicy;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Permit for one outbound request; dropping it frees the burst slot.
pub struct RatePermit {
    _burst: OwnedSemaphorePermit,
}

struct DomainWindow {
    minute: VecDeque<i64>,
    hour: VecDeque<i64>,
    burst: Arc<Semaphore>,
}

impl DomainWindow {
    fn new(burst: u32) -> Self {
        Self {
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            burst: Arc::new(Semaphore::new(burst.max(1) as usize)),
        }
    }

    fn prune(&mut self, now_ms: i64) {
        while self.minute.front().is_some_and(|&t| now_ms - t >= MINUTE_MS) {
            self.minute.pop_front();
        }
        while self.hour.front().is_some_and(|&t| now_ms - t >= HOUR_MS) {
            self.hour.pop_front();
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    domains: RwLock<HashMap<String, Arc<Mutex<DomainWindow>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn window(&self, domain: &str, policy: &RateLimitPolicy) -> Arc<Mutex<DomainWindow>> {
        if let Some(found) = self.domains.read().await.get(domain).cloned() {
            return found;
        }
        let mut guard = self.domains.write().await;
        guard
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DomainWindow::new(policy.burst))))
            .clone()
    }

    /// Consumes one slot for `domain` or reports how long until one frees.
    /// The returned permit must be held for the duration of the request.
    pub async fn allow(
        &self,
        domain: &str,
        policy: &RateLimitPolicy,
        now_ms: i64,
    ) -> Result<RatePermit, i64> {
        let window = self.window(domain, policy).await;
        let mut guard = window.lock().await;
        guard.prune(now_ms);

        if guard.minute.len() >= policy.per_minute as usize {
            let oldest = *guard.minute.front().expect("non-empty window");
            return Err((oldest + MINUTE_MS - now_ms).max(1));
        }
        if guard.hour.len() >= policy.per_hour as usize {
            let oldest = *guard.hour.front().expect("non-empty window");
            return Err((oldest + HOUR_MS - now_ms).max(1));
        }

        let burst = guard.burst.clone();
        let permit = match burst.try_acquire_owned() {
            Ok(p) => p,
            // All burst slots busy; try again shortly.
            Err(_) => return Err(1_000),
        };

        guard.minute.push_back(now_ms);
        guard.hour.push_back(now_ms);
        Ok(RatePermit { _burst: permit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(per_minute: u32, per_hour: u32, burst: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            per_minute,
            per_hour,
            burst,
        }
    }

    #[tokio::test]
    async fn denies_after_minute_budget_with_retry_after() {
        let limiter = RateLimiter::new();
        let p = policy(3, 100, 10);
        for i in 0..3 {
            let permit = limiter.allow("d", &p, 1_000 + i).await;
            assert!(permit.is_ok());
        }
        let denied = limiter.allow("d", &p, 2_000).await;
        match denied {
            Err(retry_after) => {
                // The oldest stamp (1000) frees at 61_000.
                assert_eq!(retry_after, 59_000);
            }
            Ok(_) => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn window_slides_and_frees_budget() {
        let limiter = RateLimiter::new();
        let p = policy(2, 100, 10);
        assert!(limiter.allow("d", &p, 0).await.is_ok());
        assert!(limiter.allow("d", &p, 1).await.is_ok());
        assert!(limiter.allow("d", &p, 2).await.is_err());
        assert!(limiter.allow("d", &p, 60_001).await.is_ok());
    }

    #[tokio::test]
    async fn hour_budget_is_independent() {
        let limiter = RateLimiter::new();
        let p = policy(100, 2, 10);
        assert!(limiter.allow("d", &p, 0).await.is_ok());
        assert!(limiter.allow("d", &p, 61_000).await.is_ok());
        let denied = limiter.allow("d", &p, 122_000).await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn burst_permits_bound_inflight_requests() {
        let limiter = RateLimiter::new();
        let p = policy(100, 100, 1);
        let held = limiter.allow("d", &p, 0).await.expect("first permit");
        assert!(limiter.allow("d", &p, 1).await.is_err());
        drop(held);
        assert!(limiter.allow("d", &p, 2).await.is_ok());
    }

    #[tokio::test]
    async fn domains_do_not_share_budgets() {
        let limiter = RateLimiter::new();
        let p = policy(1, 100, 10);
        assert!(limiter.allow("a", &p, 0).await.is_ok());
        assert!(limiter.allow("b", &p, 0).await.is_ok());
        assert!(limiter.allow("a", &p, 1).await.is_err());
    }
}
