//! Scheduler loop: every tick it loads targets, filters the due ones
//! (enabled, breaker allows, next-poll time reached, not already running),
//! and feeds them through a deduplicated ready queue into poll tasks bounded
//! by `max_concurrent_polls`. Also owns the reconciliation sweep, the
//! watchdog that frees stuck slots, and graceful drain on shutdown.
pub mod poll;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{stream, FutureExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::context::EngineContext;
use crate::app::rate_limiter::RateLimiter;
use crate::domain::breaker::{BreakerPhase, BreakerSettings};
use crate::infra::time::format_epoch_ms;
use crate::ports::{
    clock::Clock, deliver::Deliver, fetch::Fetch, random::RandomSource, repo::Repo,
};
use self::poll::PollKind;

/// Out-of-band requests from the admin surface.
#[derive(Debug)]
pub enum EngineCommand {
    ForcePoll(String),
    Reconcile,
}

#[derive(Default)]
struct SchedInner {
    active: HashMap<String, i64>,
    queued: HashSet<String>,
    queue: VecDeque<String>,
}

/// Ready queue + active set behind one mutex; never held across awaits.
#[derive(Default)]
pub struct SchedState {
    inner: Mutex<SchedInner>,
}

impl SchedState {
    fn enqueue(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        if inner.active.contains_key(id) || inner.queued.contains(id) {
            return false;
        }
        inner.queued.insert(id.to_string());
        inner.queue.push_back(id.to_string());
        true
    }

    fn enqueue_front(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        if inner.active.contains_key(id) || inner.queued.contains(id) {
            return false;
        }
        inner.queued.insert(id.to_string());
        inner.queue.push_front(id.to_string());
        true
    }

    fn release(&self, id: &str, started_at_ms: i64) {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        if inner.active.get(id) == Some(&started_at_ms) {
            inner.active.remove(id);
        }
    }

    /// Frees slots whose tasks have been running past the ceiling. The task
    /// itself keeps running and may still commit; only the slot is freed.
    fn evict_older_than(&self, cutoff_ms: i64) -> Vec<String> {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        let stale: Vec<String> = inner
            .active
            .iter()
            .filter(|(_, &started)| started < cutoff_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.active.remove(id);
        }
        stale
    }

    fn active_len(&self) -> usize {
        self.inner.lock().expect("scheduler state poisoned").active.len()
    }
}

/// Pops the next queued target and marks it active, respecting the
/// concurrency cap. Returns the slot guard that frees it.
fn acquire_next(state: &Arc<SchedState>, cap: usize, now_ms: i64) -> Option<(String, ActiveSlot)> {
    let mut inner = state.inner.lock().expect("scheduler state poisoned");
    if inner.active.len() >= cap {
        return None;
    }
    let id = inner.queue.pop_front()?;
    inner.queued.remove(&id);
    inner.active.insert(id.clone(), now_ms);
    Some((
        id.clone(),
        ActiveSlot {
            state: Arc::clone(state),
            id,
            started_at_ms: now_ms,
        },
    ))
}

/// Marks a target active outside the queue (reconciliation); fails if a
/// poll for it is already running.
fn acquire_exclusive(state: &Arc<SchedState>, id: &str, now_ms: i64) -> Option<ActiveSlot> {
    let mut inner = state.inner.lock().expect("scheduler state poisoned");
    if inner.active.contains_key(id) {
        return None;
    }
    inner.active.insert(id.to_string(), now_ms);
    Some(ActiveSlot {
        state: Arc::clone(state),
        id: id.to_string(),
        started_at_ms: now_ms,
    })
}

/// Releases the concurrency slot when the poll task finishes, panics
/// included. Idempotent against watchdog eviction.
struct ActiveSlot {
    state: Arc<SchedState>,
    id: String,
    started_at_ms: i64,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.state.release(&self.id, self.started_at_ms);
    }
}

pub struct Scheduler;

impl Scheduler {
    pub async fn run<R, F, D, C, G>(
        ctx: EngineContext<R, F, D, C, G>,
        mut commands: mpsc::Receiver<EngineCommand>,
    ) -> Result<(), String>
    where
        R: Repo + 'static,
        F: Fetch + 'static,
        D: Deliver + 'static,
        C: Clock + 'static,
        G: RandomSource + 'static,
    {
        let cfg = ctx.cfg.clone();
        let limiter = Arc::new(RateLimiter::new());
        let state = Arc::new(SchedState::default());
        let breaker_settings = BreakerSettings::default();

        let mut tick =
            tokio::time::interval(Duration::from_millis(cfg.scheduler.poll_interval_ms.max(100)));
        let reconcile_period = Duration::from_secs(
            cfg.scheduler.reconcile_interval_hours.max(1) * 3600,
        );
        let mut reconcile = tokio::time::interval_at(
            tokio::time::Instant::now() + reconcile_period,
            reconcile_period,
        );
        let mut watchdog = tokio::time::interval(Duration::from_secs(
            cfg.scheduler.watchdog_interval_secs.max(1),
        ));

        info!(
            max_concurrent_polls = cfg.scheduler.max_concurrent_polls,
            poll_interval_ms = cfg.scheduler.poll_interval_ms,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                Some(cmd) = commands.recv() => match cmd {
                    EngineCommand::ForcePoll(id) => {
                        info!(target_id = %id, "Force poll requested");
                        state.enqueue_front(&id);
                        Self::drain_queue(&ctx, &limiter, &state, PollKind::Forced).await;
                    }
                    EngineCommand::Reconcile => {
                        Self::reconcile_sweep(&ctx, &limiter, &state).await;
                    }
                },
                _ = reconcile.tick() => {
                    Self::reconcile_sweep(&ctx, &limiter, &state).await;
                }
                _ = watchdog.tick() => {
                    let now_ms = ctx.clock.now_epoch_ms().await;
                    let ceiling_ms = (cfg.scheduler.poll_task_ceiling_secs * 1000) as i64;
                    let evicted = state.evict_older_than(now_ms - ceiling_ms);
                    for id in evicted {
                        warn!(target_id = %id, "Watchdog evicted stuck poll slot");
                    }
                }
                _ = tick.tick() => {
                    Self::enqueue_due(&ctx, &state, &breaker_settings).await;
                    Self::drain_queue(&ctx, &limiter, &state, PollKind::Scheduled).await;
                }
            }
        }

        Self::drain_on_shutdown(&ctx, &state).await;
        info!("Scheduler stopped");
        Ok(())
    }

    async fn enqueue_due<R, F, D, C, G>(
        ctx: &EngineContext<R, F, D, C, G>,
        state: &Arc<SchedState>,
        settings: &BreakerSettings,
    ) where
        R: Repo,
        F: Fetch,
        D: Deliver,
        C: Clock,
        G: RandomSource,
    {
        let now_ms = ctx.clock.now_epoch_ms().await;
        let targets = match ctx.repo.list_targets().await {
            Ok(t) => t,
            Err(e) => {
                // The store is down; back the whole loop off until next tick.
                error!(error = %e, "Failed to load targets");
                return;
            }
        };

        let mut due = 0;
        let mut open_breakers = 0;
        for target in &targets {
            if target.runtime.breaker.phase == BreakerPhase::Open {
                open_breakers += 1;
            }
            if !target.enabled {
                continue;
            }
            if !target.runtime.breaker.allows(now_ms, settings) {
                continue;
            }
            if now_ms < target.runtime.next_poll_at_ms {
                continue;
            }
            if state.enqueue(&target.id) {
                due += 1;
            }
        }
        ctx.metrics
            .breakers_open
            .store(open_breakers, std::sync::atomic::Ordering::Relaxed);

        if due > 0 {
            debug!(
                tick_time = %format_epoch_ms(now_ms, &ctx.cfg.timezone),
                due,
                active = state.active_len(),
                "Scheduler tick"
            );
        }
    }

    async fn drain_queue<R, F, D, C, G>(
        ctx: &EngineContext<R, F, D, C, G>,
        limiter: &Arc<RateLimiter>,
        state: &Arc<SchedState>,
        kind: PollKind,
    ) where
        R: Repo + 'static,
        F: Fetch + 'static,
        D: Deliver + 'static,
        C: Clock + 'static,
        G: RandomSource + 'static,
    {
        let now_ms = ctx.clock.now_epoch_ms().await;
        while let Some((id, slot)) =
            acquire_next(state, ctx.cfg.scheduler.max_concurrent_polls, now_ms)
        {
            Self::spawn_poll(ctx, limiter, id, kind, slot);
        }
    }

    fn spawn_poll<R, F, D, C, G>(
        ctx: &EngineContext<R, F, D, C, G>,
        limiter: &Arc<RateLimiter>,
        id: String,
        kind: PollKind,
        slot: ActiveSlot,
    ) where
        R: Repo + 'static,
        F: Fetch + 'static,
        D: Deliver + 'static,
        C: Clock + 'static,
        G: RandomSource + 'static,
    {
        let ctx = ctx.clone();
        let limiter = Arc::clone(limiter);
        tokio::spawn(async move {
            let _slot = slot;
            let task = std::panic::AssertUnwindSafe(poll::run_poll(&ctx, &limiter, &id, kind));
            match task.catch_unwind().await {
                Ok(Ok(report)) => {
                    debug!(target_id = %id, ?report, "Poll finished");
                }
                Ok(Err(e)) => {
                    warn!(target_id = %id, error = %e, "Poll failed");
                }
                Err(_) => {
                    // Task boundary: a panic in one poll never takes the
                    // scheduler down, and the slot guard still releases.
                    error!(target_id = %id, "Poll task panicked");
                }
            }
        });
    }

    /// Forces a full fetch for every enabled target regardless of schedule
    /// and re-probes any open breaker.
    async fn reconcile_sweep<R, F, D, C, G>(
        ctx: &EngineContext<R, F, D, C, G>,
        limiter: &Arc<RateLimiter>,
        state: &Arc<SchedState>,
    ) where
        R: Repo + 'static,
        F: Fetch + 'static,
        D: Deliver + 'static,
        C: Clock + 'static,
        G: RandomSource + 'static,
    {
        let targets = match ctx.repo.list_targets().await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Reconcile: failed to load targets");
                return;
            }
        };
        let enabled: Vec<String> = targets
            .into_iter()
            .filter(|t| t.enabled)
            .map(|t| t.id)
            .collect();
        info!(targets = enabled.len(), "Reconciliation sweep start");

        let cap = ctx.cfg.scheduler.max_concurrent_polls.max(1);
        stream::iter(enabled)
            .for_each_concurrent(cap, |id| {
                let ctx = ctx.clone();
                let limiter = Arc::clone(limiter);
                let state = Arc::clone(state);
                async move {
                    let now_ms = ctx.clock.now_epoch_ms().await;
                    let Some(_slot) = acquire_exclusive(&state, &id, now_ms) else {
                        debug!(target_id = %id, "Reconcile: poll already in flight, skipping");
                        return;
                    };
                    if let Err(e) = poll::run_poll(&ctx, &limiter, &id, PollKind::Reconcile).await {
                        warn!(target_id = %id, error = %e, "Reconcile poll failed");
                    }
                }
            })
            .await;
        info!("Reconciliation sweep complete");
    }

    async fn drain_on_shutdown<R, F, D, C, G>(
        ctx: &EngineContext<R, F, D, C, G>,
        state: &Arc<SchedState>,
    ) where
        R: Repo,
        F: Fetch,
        D: Deliver,
        C: Clock,
        G: RandomSource,
    {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(ctx.cfg.scheduler.drain_deadline_secs);
        while state.active_len() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    abandoned = state.active_len(),
                    "Drain deadline reached, abandoning in-flight polls"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
