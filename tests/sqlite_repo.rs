mod common;

use common::{raw_listing, snapshot_for, target, test_engine};
use listwatch::domain::diff::{diff_snapshot, DiffOptions};
use listwatch::domain::event::EventStatus;
use listwatch::ports::repo::{EventOutcome, Repo};
use serde_json::Value;

fn diff_opts(t: &listwatch::domain::target::PollingTarget) -> DiffOptions {
    DiffOptions {
        tracked_fields: t.tracked_fields.clone(),
        ignored_fields: t.ignored_fields.clone(),
        grace_period_ms: (t.grace_period_secs * 1000) as i64,
        min_significance: 0.1,
        metadata: Value::Null,
    }
}

#[tokio::test]
async fn target_round_trips_through_store() {
    let engine = test_engine(1_000).await;
    let mut t = target("t1");
    t.runtime.next_poll_at_ms = 42;
    t.runtime.consecutive_failures = 2;
    t.runtime.first_page_ids = vec!["a".into(), "b".into()];

    engine.repo.upsert_target(&t).await.unwrap();
    let loaded = engine.repo.get_target("t1").await.unwrap().unwrap();

    assert_eq!(loaded.url, t.url);
    assert_eq!(loaded.runtime.next_poll_at_ms, 42);
    assert_eq!(loaded.runtime.consecutive_failures, 2);
    assert_eq!(loaded.runtime.first_page_ids, vec!["a", "b"]);
    assert_eq!(loaded.adaptive.stability_bonus, t.adaptive.stability_bonus);

    assert!(engine.repo.delete_target("t1").await.unwrap());
    assert!(engine.repo.get_target("t1").await.unwrap().is_none());
    assert!(!engine.repo.delete_target("t1").await.unwrap());
}

#[tokio::test]
async fn commit_poll_outcome_is_atomic_and_visible() {
    let engine = test_engine(1_000).await;
    let t = target("t1");
    engine.repo.upsert_target(&t).await.unwrap();

    let snap = snapshot_for(&t, vec![raw_listing("a", "X", 100)], true);
    let outcome = diff_snapshot(&snap, &[], &diff_opts(&t), 1_000);
    assert_eq!(outcome.events.len(), 1);

    engine
        .repo
        .commit_poll_outcome(&t, &outcome.listings, &outcome.events)
        .await
        .unwrap();

    let listing = engine
        .repo
        .get_listing(t.source(), "a")
        .await
        .unwrap()
        .expect("listing persisted");
    assert_eq!(listing.version, 1);

    let claimed = engine
        .repo
        .claim_pending_events(10, 60_000, 2_000)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].listing_id, "a");
    assert_eq!(claimed[0].status, EventStatus::InFlight);
}

#[tokio::test]
async fn listing_versions_grow_monotonically_across_commits() {
    let engine = test_engine(1_000).await;
    let t = target("t1");
    engine.repo.upsert_target(&t).await.unwrap();

    let opts = diff_opts(&t);
    let snap1 = snapshot_for(&t, vec![raw_listing("a", "X", 100)], true);
    let out1 = diff_snapshot(&snap1, &[], &opts, 1_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out1.listings, &out1.events)
        .await
        .unwrap();

    let canonical = engine.repo.list_listings(t.source()).await.unwrap();
    let snap2 = snapshot_for(&t, vec![raw_listing("a", "X", 50)], true);
    let out2 = diff_snapshot(&snap2, &canonical, &opts, 2_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out2.listings, &out2.events)
        .await
        .unwrap();

    let listing = engine
        .repo
        .get_listing(t.source(), "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.version, 2);

    // Event versions for the listing come out strictly increasing, one
    // claim at a time while the predecessor is unfinished.
    let first = engine
        .repo
        .claim_pending_events(10, 60_000, 3_000)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].version, 1);
    engine
        .repo
        .complete_event(&first[0].event_id, EventOutcome::Processed, 3_500)
        .await
        .unwrap();
    let second = engine
        .repo
        .claim_pending_events(10, 60_000, 4_000)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].version, 2);
}

#[tokio::test]
async fn claim_holds_back_successor_until_predecessor_finishes() {
    let engine = test_engine(1_000).await;
    let t = target("t1");
    engine.repo.upsert_target(&t).await.unwrap();

    let opts = diff_opts(&t);
    let snap1 = snapshot_for(&t, vec![raw_listing("a", "X", 100)], true);
    let out1 = diff_snapshot(&snap1, &[], &opts, 1_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out1.listings, &out1.events)
        .await
        .unwrap();

    // Claim v1, leaving it in flight.
    let first = engine
        .repo
        .claim_pending_events(10, 60_000, 2_000)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    let v1_id = first[0].event_id.clone();

    // A second change lands while v1 is still in flight.
    let canonical = engine.repo.list_listings(t.source()).await.unwrap();
    let snap2 = snapshot_for(&t, vec![raw_listing("a", "X", 50)], true);
    let out2 = diff_snapshot(&snap2, &canonical, &opts, 3_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out2.listings, &out2.events)
        .await
        .unwrap();

    // v2 must not be claimable until v1 completes.
    let held = engine
        .repo
        .claim_pending_events(10, 60_000, 4_000)
        .await
        .unwrap();
    assert!(held.is_empty());

    engine
        .repo
        .complete_event(&v1_id, EventOutcome::Processed, 5_000)
        .await
        .unwrap();
    let second = engine
        .repo
        .claim_pending_events(10, 60_000, 6_000)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].version, 2);
}

#[tokio::test]
async fn expired_leases_are_reclaimed() {
    let engine = test_engine(1_000).await;
    let t = target("t1");
    engine.repo.upsert_target(&t).await.unwrap();

    let opts = diff_opts(&t);
    let snap = snapshot_for(&t, vec![raw_listing("a", "X", 100)], true);
    let out = diff_snapshot(&snap, &[], &opts, 1_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out.listings, &out.events)
        .await
        .unwrap();

    let claimed = engine
        .repo
        .claim_pending_events(10, 1_000, 2_000)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // Lease still live: nothing to claim.
    assert!(engine
        .repo
        .claim_pending_events(10, 1_000, 2_500)
        .await
        .unwrap()
        .is_empty());

    // Lease expired: the event comes back.
    let reclaimed = engine
        .repo
        .claim_pending_events(10, 1_000, 3_500)
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].event_id, claimed[0].event_id);
}

#[tokio::test]
async fn retry_and_dead_letter_accounting() {
    let engine = test_engine(1_000).await;
    let t = target("t1");
    engine.repo.upsert_target(&t).await.unwrap();

    let opts = diff_opts(&t);
    let snap = snapshot_for(&t, vec![raw_listing("a", "X", 100)], true);
    let out = diff_snapshot(&snap, &[], &opts, 1_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out.listings, &out.events)
        .await
        .unwrap();

    let claimed = engine
        .repo
        .claim_pending_events(10, 60_000, 2_000)
        .await
        .unwrap();
    let id = claimed[0].event_id.clone();

    engine
        .repo
        .complete_event(
            &id,
            EventOutcome::Retry {
                next_attempt_at_ms: 10_000,
            },
            2_500,
        )
        .await
        .unwrap();

    // Not yet eligible.
    assert!(engine
        .repo
        .claim_pending_events(10, 60_000, 5_000)
        .await
        .unwrap()
        .is_empty());

    let retried = engine
        .repo
        .claim_pending_events(10, 60_000, 10_000)
        .await
        .unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].retry_count, 1);

    engine
        .repo
        .complete_event(&id, EventOutcome::DeadLetter, 11_000)
        .await
        .unwrap();
    assert!(engine
        .repo
        .claim_pending_events(10, 60_000, 20_000)
        .await
        .unwrap()
        .is_empty());

    let depth = engine.repo.outbox_depth().await.unwrap();
    assert_eq!(depth, vec![("FAILED".to_string(), 1)]);
}

#[tokio::test]
async fn mark_listing_removed_bumps_version_once() {
    let engine = test_engine(1_000).await;
    let t = target("t1");

    let opts = diff_opts(&t);
    let snap = snapshot_for(&t, vec![raw_listing("a", "X", 100)], true);
    let out = diff_snapshot(&snap, &[], &opts, 1_000);
    engine
        .repo
        .commit_poll_outcome(&t, &out.listings, &out.events)
        .await
        .unwrap();

    engine
        .repo
        .mark_listing_removed(t.source(), "a", 5_000)
        .await
        .unwrap();
    // Already removed: the second call is a no-op.
    engine
        .repo
        .mark_listing_removed(t.source(), "a", 6_000)
        .await
        .unwrap();

    let listing = engine
        .repo
        .get_listing(t.source(), "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        listing.status,
        listwatch::domain::listing::ListingStatus::Removed
    );
    assert_eq!(listing.version, 2);
    assert_eq!(listing.last_seen_at_ms, 5_000);
}

#[tokio::test]
async fn subscriber_crud_round_trips() {
    let engine = test_engine(1_000).await;
    let sub = listwatch::domain::model::Subscriber {
        id: "hook".into(),
        kind: listwatch::domain::model::SubscriberKind::Webhook,
        endpoint: "https://hooks.example.com/x".into(),
        timeout_ms: Some(5_000),
        max_retries: Some(3),
        enabled: true,
    };
    engine.repo.upsert_subscriber(&sub).await.unwrap();

    let listed = engine.repo.list_subscribers().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].endpoint, sub.endpoint);
    assert_eq!(listed[0].timeout_ms, Some(5_000));

    assert!(engine.repo.delete_subscriber("hook").await.unwrap());
    assert!(engine.repo.list_subscribers().await.unwrap().is_empty());
}
