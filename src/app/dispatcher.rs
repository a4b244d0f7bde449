//! Dispatcher: drains the event outbox to subscribers with at-least-once
//! semantics. Claimed events are routed to a fixed pool of workers by a hash
//! of the listing id, so one listing's events are always handled by the same
//! worker, in version order.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::context::EngineContext;
use crate::domain::event::ChangeEvent;
use crate::ports::repo::EventOutcome;
use crate::ports::{
    clock::Clock, deliver::Deliver, fetch::Fetch, random::RandomSource, repo::Repo,
};

pub struct Dispatcher;

impl Dispatcher {
    pub async fn run<R, F, D, C, G>(ctx: EngineContext<R, F, D, C, G>) -> Result<(), String>
    where
        R: Repo + 'static,
        F: Fetch + 'static,
        D: Deliver + 'static,
        C: Clock + 'static,
        G: RandomSource + 'static,
    {
        let cfg = ctx.cfg.clone();
        let worker_count = cfg.dispatcher.worker_count.max(1);

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for shard in 0..worker_count {
            let (tx, rx) = mpsc::channel::<ChangeEvent>(64);
            senders.push(tx);
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(ctx, shard, rx).await;
            }));
        }

        info!(workers = worker_count, "Dispatcher started");
        let mut tick = tokio::time::interval(Duration::from_millis(
            cfg.dispatcher.processing_interval_ms.max(50),
        ));

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let now_ms = ctx.clock.now_epoch_ms().await;
                    let claimed = match ctx
                        .repo
                        .claim_pending_events(cfg.dispatcher.batch_size, cfg.dispatcher.lease_ms, now_ms)
                        .await
                    {
                        Ok(events) => events,
                        Err(e) => {
                            // Store trouble: stop claiming until the next tick.
                            error!(error = %e, "Failed to claim events");
                            continue;
                        }
                    };
                    if claimed.is_empty() {
                        continue;
                    }
                    debug!(claimed = claimed.len(), "Claimed outbox batch");
                    for event in claimed {
                        let shard = shard_for(&event, worker_count);
                        if senders[shard].send(event).await.is_err() {
                            error!(shard, "Dispatcher worker channel closed");
                        }
                    }
                }
            }
        }

        drop(senders);
        for worker in workers {
            let _ = worker.await;
        }
        info!("Dispatcher stopped");
        Ok(())
    }
}

fn shard_for(event: &ChangeEvent, worker_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    event.source.hash(&mut hasher);
    event.listing_id.hash(&mut hasher);
    (hasher.finish() % worker_count as u64) as usize
}

async fn worker_loop<R, F, D, C, G>(
    ctx: EngineContext<R, F, D, C, G>,
    shard: usize,
    mut rx: mpsc::Receiver<ChangeEvent>,
) where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };
        if let Err(e) = process_event(&ctx, &event).await {
            warn!(shard, event_id = %event.event_id, error = %e, "Event processing failed");
        }
    }
    debug!(shard, "Dispatcher worker stopped");
}

async fn process_event<R, F, D, C, G>(
    ctx: &EngineContext<R, F, D, C, G>,
    event: &ChangeEvent,
) -> Result<(), String>
where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    let now_ms = ctx.clock.now_epoch_ms().await;
    let subscribers = ctx.repo.list_subscribers().await?;
    let enabled: Vec<_> = subscribers.into_iter().filter(|s| s.enabled).collect();

    // Nobody to notify: the event is done the moment it is claimed.
    if enabled.is_empty() {
        return ctx
            .repo
            .complete_event(&event.event_id, EventOutcome::Processed, now_ms)
            .await;
    }

    let body = event.webhook_payload(now_ms);
    let attempts = enabled.iter().map(|subscriber| {
        let body = body.as_str();
        async move { ctx.sink.deliver(subscriber, event, body).await }
    });
    let results = join_all(attempts).await;

    let mut all_ok = true;
    for (subscriber, result) in enabled.iter().zip(results) {
        match result {
            Ok(()) => {
                ctx.metrics.deliveries_ok.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                all_ok = false;
                ctx.metrics.deliveries_err.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscriber = %subscriber.id,
                    event_id = %event.event_id,
                    error = %e,
                    "Delivery failed"
                );
            }
        }
    }

    let outcome = if all_ok {
        EventOutcome::Processed
    } else {
        let max_retries = effective_max_retries(ctx, &enabled);
        if event.retry_count + 1 >= max_retries {
            ctx.metrics.dead_letters.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %event.event_id,
                retries = event.retry_count + 1,
                "Event dead-lettered"
            );
            EventOutcome::DeadLetter
        } else {
            let delay_ms = retry_delay_ms(
                ctx.cfg.dispatcher.retry_base_ms,
                ctx.cfg.dispatcher.retry_cap_ms,
                event.retry_count,
                ctx.rng.next_f64().await,
            );
            EventOutcome::Retry {
                next_attempt_at_ms: now_ms + delay_ms as i64,
            }
        }
    };

    ctx.repo
        .complete_event(&event.event_id, outcome, now_ms)
        .await
}

fn effective_max_retries<R, F, D, C, G>(
    ctx: &EngineContext<R, F, D, C, G>,
    subscribers: &[crate::domain::model::Subscriber],
) -> u32
where
    R: Repo,
    F: Fetch,
    D: Deliver,
    C: Clock,
    G: RandomSource,
{
    subscribers
        .iter()
        .filter_map(|s| s.max_retries)
        .max()
        .unwrap_or(ctx.cfg.dispatcher.max_retries)
        .max(1)
}

/// Full-jitter exponential backoff: uniform in `[0, min(base * 2^n, cap)]`.
pub fn retry_delay_ms(base_ms: u64, cap_ms: u64, retry_count: u32, rand01: f64) -> u64 {
    let exp = retry_count.min(16);
    let ceiling = base_ms.saturating_mul(1_u64 << exp).min(cap_ms).max(1);
    (rand01.clamp(0.0, 1.0) * ceiling as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_never_exceeds_cap() {
        assert_eq!(retry_delay_ms(1_000, 300_000, 30, 1.0), 300_000);
        assert!(retry_delay_ms(1_000, 300_000, 3, 0.5) <= 8_000);
    }

    #[test]
    fn retry_delay_uses_full_jitter() {
        assert_eq!(retry_delay_ms(1_000, 300_000, 0, 0.0), 0);
        assert_eq!(retry_delay_ms(1_000, 300_000, 0, 1.0), 1_000);
    }
}
