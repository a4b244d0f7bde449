//! Advisory in-process cache for listing lookups by id. Reads fall through
//! to the durable store on miss; every write path invalidates its key.
use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::listing::CanonicalListing;

#[derive(Default)]
pub struct ListingCache {
    inner: RwLock<HashMap<(String, String), CanonicalListing>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, source: &str, listing_id: &str) -> Option<CanonicalListing> {
        let guard = self.inner.read().await;
        guard
            .get(&(source.to_string(), listing_id.to_string()))
            .cloned()
    }

    pub async fn put(&self, listing: &CanonicalListing) {
        let mut guard = self.inner.write().await;
        guard.insert(
            (listing.source.clone(), listing.listing_id.clone()),
            listing.clone(),
        );
    }

    pub async fn invalidate(&self, source: &str, listing_id: &str) {
        let mut guard = self.inner.write().await;
        guard.remove(&(source.to_string(), listing_id.to_string()));
    }
}
