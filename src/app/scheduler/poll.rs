//! One poll of one target: rate-limit gate, first-page fast path, full
//! fetch, diff, and a single transactional commit of target state, listing
//! mutations, and outbox events.
use std::collections::HashSet;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::app::context::EngineContext;
use crate::app::rate_limiter::RateLimiter;
use crate::domain::breaker::BreakerSettings;
use crate::domain::diff::{diff_snapshot, DiffOptions};
use crate::domain::listing::FetchSnapshot;
use crate::domain::poll_policy::{
    change_rate, error_backoff_secs, next_interval_secs, trim_change_history,
};
use crate::domain::target::PollingTarget;
use crate::ports::{
    clock::Clock, deliver::Deliver, fetch::Fetch, random::RandomSource, repo::Repo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    Scheduled,
    /// Admin-triggered; ignores the schedule but respects the breaker.
    Forced,
    /// Reconciliation; full fetch, re-probes open breakers.
    Reconcile,
}

#[derive(Debug, Default)]
pub struct PollReport {
    pub events_emitted: usize,
    pub fast_path: bool,
    pub rate_limited: bool,
    pub skipped: Option<&'static str>,
}

pub async fn run_poll<R, F, D, C, G>(
    ctx: &EngineContext<R, F, D, C, G>,
    limiter: &RateLimiter,
    target_id: &str,
    kind: PollKind,
) -> Result<PollReport, String>
where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    let settings = BreakerSettings::default();
    let Some(mut target) = ctx.repo.get_target(target_id).await? else {
        return Ok(PollReport {
            skipped: Some("missing"),
            ..Default::default()
        });
    };
    if !target.enabled {
        return Ok(PollReport {
            skipped: Some("disabled"),
            ..Default::default()
        });
    }

    let now_ms = ctx.clock.now_epoch_ms().await;
    match kind {
        PollKind::Reconcile => target.runtime.breaker.force_half_open(),
        _ => {
            if !target.runtime.breaker.allows(now_ms, &settings) {
                return Ok(PollReport {
                    skipped: Some("breaker-open"),
                    ..Default::default()
                });
            }
            target.runtime.breaker.begin_probe(now_ms, &settings);
        }
    }

    let _inflight = ctx.metrics.poll_started();

    // Per-domain budget; denial is a reschedule, not a breaker failure.
    let permit = match limiter
        .allow(&target.domain, &target.rate_limit, now_ms)
        .await
    {
        Ok(p) => p,
        Err(retry_after_ms) => {
            debug!(
                target_id = %target.id,
                retry_after_ms,
                "Rate limited, rescheduling"
            );
            target.runtime.next_poll_at_ms = now_ms + retry_after_ms;
            ctx.repo.upsert_target(&target).await?;
            ctx.metrics
                .polls_rate_limited
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(PollReport {
                rate_limited: true,
                ..Default::default()
            });
        }
    };

    // First-page fast path: unchanged id set means nothing to diff.
    if kind == PollKind::Scheduled && !target.runtime.first_page_ids.is_empty() {
        match ctx.fetcher.fetch(&target, false).await {
            Ok(first_page) => {
                if same_id_set(&first_page.first_page_ids, &target.runtime.first_page_ids) {
                    drop(permit);
                    finish_success(ctx, &mut target, &first_page, now_ms, 0);
                    ctx.repo.upsert_target(&target).await?;
                    ctx.metrics
                        .fast_path_hits
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    ctx.metrics
                        .polls_ok
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Ok(PollReport {
                        fast_path: true,
                        ..Default::default()
                    });
                }
            }
            Err(e) => {
                drop(permit);
                return fail_poll(ctx, target, now_ms, e).await;
            }
        }
    }

    let snapshot = match ctx.fetcher.fetch(&target, true).await {
        Ok(s) => s,
        Err(e) => {
            drop(permit);
            return fail_poll(ctx, target, now_ms, e).await;
        }
    };
    drop(permit);

    let canonical = ctx.repo.list_listings(target.source()).await?;
    let opts = DiffOptions {
        tracked_fields: target.tracked_fields.clone(),
        ignored_fields: target.ignored_fields.clone(),
        grace_period_ms: (target.grace_period_secs * 1000) as i64,
        min_significance: ctx.cfg.min_significance,
        metadata: json!({ "targetId": target.id }),
    };
    let outcome = diff_snapshot(&snapshot, &canonical, &opts, now_ms);

    for event in &outcome.events {
        ctx.metrics.record_event_emitted(event.event_type);
    }

    finish_success(ctx, &mut target, &snapshot, now_ms, outcome.events.len());
    ctx.repo
        .commit_poll_outcome(&target, &outcome.listings, &outcome.events)
        .await?;
    ctx.metrics
        .polls_ok
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    if !outcome.events.is_empty() {
        info!(
            target_id = %target.id,
            events = outcome.events.len(),
            listings = outcome.listings.len(),
            "Changes detected"
        );
    }

    Ok(PollReport {
        events_emitted: outcome.events.len(),
        ..Default::default()
    })
}

/// Success bookkeeping shared by the fast path and the full poll.
fn finish_success<R, F, D, C, G>(
    ctx: &EngineContext<R, F, D, C, G>,
    target: &mut PollingTarget,
    snapshot: &FetchSnapshot,
    now_ms: i64,
    new_changes: usize,
) where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    let settings = BreakerSettings::default();
    let runtime = &mut target.runtime;
    runtime.last_polled_at_ms = Some(now_ms);
    runtime.last_success_at_ms = Some(now_ms);
    runtime.consecutive_failures = 0;
    runtime.breaker.record_success(&settings);
    runtime.first_page_ids = snapshot.first_page_ids.clone();
    runtime.etag = snapshot.etag.clone();
    runtime.last_modified = snapshot.last_modified.clone();

    for _ in 0..new_changes {
        runtime.change_history_ms.push(now_ms);
    }
    trim_change_history(&mut runtime.change_history_ms, now_ms);
    runtime.change_rate = change_rate(
        &runtime.change_history_ms,
        now_ms,
        target.adaptive.learning_window_hours,
    );

    let interval_secs = next_interval_secs(
        target,
        now_ms,
        &ctx.cfg.timezone,
        &ctx.cfg.scheduler.peak_hours,
    );
    target.runtime.next_poll_at_ms = now_ms + (interval_secs * 1000) as i64;
}

async fn fail_poll<R, F, D, C, G>(
    ctx: &EngineContext<R, F, D, C, G>,
    mut target: PollingTarget,
    now_ms: i64,
    error: crate::ports::fetch::FetchError,
) -> Result<PollReport, String>
where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    let settings = BreakerSettings::default();
    warn!(
        target_id = %target.id,
        error = %error,
        consecutive_failures = target.runtime.consecutive_failures + 1,
        "Fetch failed"
    );

    let runtime = &mut target.runtime;
    runtime.last_polled_at_ms = Some(now_ms);
    runtime.consecutive_failures += 1;
    if error.is_transient() {
        runtime.breaker.record_failure(now_ms, &settings);
    }
    trim_change_history(&mut runtime.change_history_ms, now_ms);
    runtime.change_rate = change_rate(
        &runtime.change_history_ms,
        now_ms,
        target.adaptive.learning_window_hours,
    );

    let interval_secs = next_interval_secs(
        &target,
        now_ms,
        &ctx.cfg.timezone,
        &ctx.cfg.scheduler.peak_hours,
    );
    let backoff_secs = error_backoff_secs(target.runtime.consecutive_failures);
    target.runtime.next_poll_at_ms = now_ms + ((interval_secs + backoff_secs) * 1000) as i64;

    ctx.repo.upsert_target(&target).await?;
    ctx.metrics
        .polls_err
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Ok(PollReport::default())
}

fn same_id_set(a: &[String], b: &[String]) -> bool {
    let sa: HashSet<&str> = a.iter().map(String::as_str).collect();
    let sb: HashSet<&str> = b.iter().map(String::as_str).collect();
    sa == sb
}
