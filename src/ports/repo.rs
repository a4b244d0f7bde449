//! Store abstraction over canonical listings, polling targets, the event
//! outbox, and subscribers. All persistent mutations travel through here.
use crate::domain::event::ChangeEvent;
use crate::domain::listing::CanonicalListing;
use crate::domain::model::Subscriber;
use crate::domain::target::PollingTarget;

/// Terminal disposition of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Processed,
    /// Back to the queue; eligible again at the given time.
    Retry { next_attempt_at_ms: i64 },
    /// Out of retries; kept visible but not re-attempted.
    DeadLetter,
}

#[async_trait::async_trait]
pub trait Repo: Send + Sync {
    async fn migrate(&self) -> Result<(), String>;

    async fn get_listing(
        &self,
        source: &str,
        listing_id: &str,
    ) -> Result<Option<CanonicalListing>, String>;
    async fn list_listings(&self, source: &str) -> Result<Vec<CanonicalListing>, String>;
    async fn upsert_listing(&self, listing: &CanonicalListing) -> Result<(), String>;
    async fn mark_listing_removed(
        &self,
        source: &str,
        listing_id: &str,
        detected_at_ms: i64,
    ) -> Result<(), String>;

    async fn get_target(&self, id: &str) -> Result<Option<PollingTarget>, String>;
    async fn list_targets(&self) -> Result<Vec<PollingTarget>, String>;
    async fn upsert_target(&self, target: &PollingTarget) -> Result<(), String>;
    async fn delete_target(&self, id: &str) -> Result<bool, String>;

    async fn append_events(&self, events: &[ChangeEvent]) -> Result<(), String>;

    /// Persists target state, listing mutations, and outbox events in one
    /// transaction: no event is visible without its listing update.
    async fn commit_poll_outcome(
        &self,
        target: &PollingTarget,
        listings: &[CanonicalListing],
        events: &[ChangeEvent],
    ) -> Result<(), String>;

    /// Atomically flips eligible PENDING events to IN_FLIGHT under a lease.
    /// Expired IN_FLIGHT leases are reclaimed first; an event stays back
    /// while an earlier version for the same listing is unfinished.
    async fn claim_pending_events(
        &self,
        limit: i64,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<ChangeEvent>, String>;

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        now_ms: i64,
    ) -> Result<(), String>;

    /// `(status, count)` pairs over the outbox.
    async fn outbox_depth(&self) -> Result<Vec<(String, i64)>, String>;

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, String>;
    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<(), String>;
    async fn delete_subscriber(&self, id: &str) -> Result<bool, String>;
}
