//! SQLite-backed store: canonical listings, polling targets, the event
//! outbox, and subscribers, fronted by an advisory in-process cache.
pub mod connection;
pub mod migrations;

mod events;
mod listings;
mod subscribers;
mod targets;

use std::path::Path;

use sqlx::SqlitePool;
use tracing::debug;

use crate::domain::event::ChangeEvent;
use crate::domain::listing::CanonicalListing;
use crate::domain::model::Subscriber;
use crate::domain::target::PollingTarget;
use crate::infra::cache::ListingCache;
use crate::ports::repo::{EventOutcome, Repo};

pub struct SqliteRepo {
    pool: SqlitePool,
    cache: ListingCache,
}

impl SqliteRepo {
    pub async fn new(db_path: &Path) -> Result<Self, String> {
        let pool = connection::create_pool(db_path).await?;
        Ok(Self {
            pool,
            cache: ListingCache::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Repo for SqliteRepo {
    async fn migrate(&self) -> Result<(), String> {
        migrations::migrate(&self.pool).await
    }

    async fn get_listing(
        &self,
        source: &str,
        listing_id: &str,
    ) -> Result<Option<CanonicalListing>, String> {
        if let Some(hit) = self.cache.get(source, listing_id).await {
            return Ok(Some(hit));
        }
        let listing = listings::get(&self.pool, source, listing_id).await?;
        if let Some(ref found) = listing {
            self.cache.put(found).await;
        }
        Ok(listing)
    }

    async fn list_listings(&self, source: &str) -> Result<Vec<CanonicalListing>, String> {
        listings::list(&self.pool, source).await
    }

    async fn upsert_listing(&self, listing: &CanonicalListing) -> Result<(), String> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| format!("acquire error: {e}"))?;
        listings::upsert(&mut conn, listing, now_epoch_ms()).await?;
        self.cache
            .invalidate(&listing.source, &listing.listing_id)
            .await;
        Ok(())
    }

    async fn mark_listing_removed(
        &self,
        source: &str,
        listing_id: &str,
        detected_at_ms: i64,
    ) -> Result<(), String> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| format!("acquire error: {e}"))?;
        listings::mark_removed(&mut conn, source, listing_id, detected_at_ms).await?;
        self.cache.invalidate(source, listing_id).await;
        Ok(())
    }

    async fn get_target(&self, id: &str) -> Result<Option<PollingTarget>, String> {
        targets::get(&self.pool, id).await
    }

    async fn list_targets(&self) -> Result<Vec<PollingTarget>, String> {
        targets::list(&self.pool).await
    }

    async fn upsert_target(&self, target: &PollingTarget) -> Result<(), String> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| format!("acquire error: {e}"))?;
        targets::upsert(&mut conn, target, now_epoch_ms()).await
    }

    async fn delete_target(&self, id: &str) -> Result<bool, String> {
        targets::delete(&self.pool, id).await
    }

    async fn append_events(&self, events: &[ChangeEvent]) -> Result<(), String> {
        if events.is_empty() {
            return Ok(());
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("tx begin: {e}"))?;
        let now_ms = now_epoch_ms();
        for event in events {
            events::insert(&mut *tx, event, now_ms).await?;
        }
        tx.commit().await.map_err(|e| format!("tx commit: {e}"))?;
        Ok(())
    }

    async fn commit_poll_outcome(
        &self,
        target: &PollingTarget,
        listings: &[CanonicalListing],
        events: &[ChangeEvent],
    ) -> Result<(), String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("tx begin: {e}"))?;
        let now_ms = now_epoch_ms();

        targets::upsert(&mut *tx, target, now_ms).await?;
        for listing in listings {
            listings::upsert(&mut *tx, listing, now_ms).await?;
        }
        for event in events {
            events::insert(&mut *tx, event, now_ms).await?;
        }

        tx.commit().await.map_err(|e| format!("tx commit: {e}"))?;

        for listing in listings {
            self.cache
                .invalidate(&listing.source, &listing.listing_id)
                .await;
        }
        debug!(
            target_id = %target.id,
            listings = listings.len(),
            events = events.len(),
            "Committed poll outcome"
        );
        Ok(())
    }

    async fn claim_pending_events(
        &self,
        limit: i64,
        lease_ms: i64,
        now_ms: i64,
    ) -> Result<Vec<ChangeEvent>, String> {
        events::claim_pending(&self.pool, limit, lease_ms, now_ms).await
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        now_ms: i64,
    ) -> Result<(), String> {
        events::complete(&self.pool, event_id, outcome, now_ms).await
    }

    async fn outbox_depth(&self) -> Result<Vec<(String, i64)>, String> {
        events::depth_by_status(&self.pool).await
    }

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, String> {
        subscribers::list(&self.pool).await
    }

    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<(), String> {
        subscribers::upsert(&self.pool, subscriber, now_epoch_ms()).await
    }

    async fn delete_subscriber(&self, id: &str) -> Result<bool, String> {
        subscribers::delete(&self.pool, id).await
    }
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
