//! Canonical listings and the snapshots the fetch port hands back.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::event::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Active,
    Removed,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "ACTIVE",
            ListingStatus::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ListingStatus::Active),
            "REMOVED" => Some(ListingStatus::Removed),
            _ => None,
        }
    }
}

/// One entry of a listing's bounded change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub at_ms: i64,
    pub event_type: EventType,
    pub version: i64,
}

pub const CHANGE_HISTORY_CAP: usize = 50;

/// The engine's persistent view of a remote listing, identified by
/// `(source, listing_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalListing {
    pub source: String,
    pub listing_id: String,
    pub first_seen_at_ms: i64,
    pub last_seen_at_ms: i64,
    pub status: ListingStatus,
    /// Tracked-field values as last scraped, keyed by field name.
    pub fields: BTreeMap<String, Value>,
    pub image_urls: Vec<String>,
    pub version: i64,
    pub field_hash: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub tracked_fields: Vec<String>,
    pub change_history: Vec<ChangeRecord>,
    pub raw_data: Value,
}

impl CanonicalListing {
    pub fn push_history(&mut self, record: ChangeRecord) {
        self.change_history.push(record);
        if self.change_history.len() > CHANGE_HISTORY_CAP {
            let excess = self.change_history.len() - CHANGE_HISTORY_CAP;
            self.change_history.drain(..excess);
        }
    }
}

/// A raw listing as scraped from the remote index: the tracked core is
/// typed, everything else rides along as an opaque blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawListing {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<serde_json::Number>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "imageUrls", alias = "image_urls")]
    pub image_urls: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RawListing {
    /// Value of a tracked field by name. The typed core wins; anything else
    /// falls through to the opaque remainder.
    pub fn field(&self, name: &str) -> Value {
        match name {
            "title" => self.title.clone().map(Value::String).unwrap_or(Value::Null),
            "price" => self
                .price
                .clone()
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "condition" => self
                .condition
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            "location" => self
                .location
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            "url" => self.url.clone().map(Value::String).unwrap_or(Value::Null),
            other => self.extra.get(other).cloned().unwrap_or(Value::Null),
        }
    }

    /// The full raw payload, re-assembled for storage.
    pub fn to_raw_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Result of one fetch over a target's listing surface.
#[derive(Debug, Clone)]
pub struct FetchSnapshot {
    pub source: String,
    pub listings: Vec<RawListing>,
    pub total_listings: usize,
    pub pages_scraped: u32,
    pub scraped_at_ms: i64,
    /// Whether the fetch covered the complete result surface. Removal
    /// detection is only trusted on full snapshots.
    pub full: bool,
    /// Listing ids of the first page, in index order.
    pub first_page_ids: Vec<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}
