//! Diff engine: compares a fetched snapshot against the stored canonical
//! listings for a source and produces change events plus the updated
//! canonical set. Deterministic; all clock input comes from the caller.
use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use uuid::Uuid;

use crate::domain::event::{
    ChangeEvent, EventStatus, EventType, FieldChange, FieldChangeKind, SignificanceBucket,
};
use crate::domain::hashing::field_hash;
use crate::domain::listing::{CanonicalListing, ChangeRecord, FetchSnapshot, ListingStatus, RawListing};

pub const DEFAULT_MIN_SIGNIFICANCE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub tracked_fields: Vec<String>,
    pub ignored_fields: Vec<String>,
    pub grace_period_ms: i64,
    pub min_significance: f64,
    /// Opaque metadata stamped onto every emitted event.
    pub metadata: Value,
}

#[derive(Debug, Default)]
pub struct DiffOutcome {
    pub events: Vec<ChangeEvent>,
    /// Canonical rows to upsert: new listings, mutated listings, and pure
    /// sighting refreshes (last-seen bumps without a version change).
    pub listings: Vec<CanonicalListing>,
}

pub fn diff_snapshot(
    snapshot: &FetchSnapshot,
    canonical: &[CanonicalListing],
    opts: &DiffOptions,
    now_ms: i64,
) -> DiffOutcome {
    let mut scraped: HashMap<&str, &RawListing> = HashMap::new();
    for raw in &snapshot.listings {
        // First occurrence wins on duplicated ids within one snapshot.
        scraped.entry(raw.id.as_str()).or_insert(raw);
    }
    let stored: HashMap<&str, &CanonicalListing> =
        canonical.iter().map(|c| (c.listing_id.as_str(), c)).collect();

    let mut out = DiffOutcome::default();

    for (id, raw) in &scraped {
        match stored.get(id) {
            None => {
                let (listing, event) = create_listing(&snapshot.source, raw, snapshot, opts, now_ms);
                out.listings.push(listing);
                out.events.push(event);
            }
            Some(existing) if existing.status == ListingStatus::Removed => {
                // Relisted under the same id: revive in place, version keeps
                // climbing.
                let (listing, event) = revive_listing(existing, raw, snapshot, opts, now_ms);
                out.listings.push(listing);
                out.events.push(event);
            }
            Some(existing) => {
                let (listing, event) = update_listing(existing, raw, snapshot, opts, now_ms);
                out.listings.push(listing);
                if let Some(ev) = event {
                    out.events.push(ev);
                }
            }
        }
    }

    for existing in canonical {
        if existing.status != ListingStatus::Active
            || scraped.contains_key(existing.listing_id.as_str())
        {
            continue;
        }
        // Removal is only trusted when the fetch covered the full surface
        // and the listing has been unseen past the grace period.
        if !snapshot.full {
            continue;
        }
        if now_ms - existing.last_seen_at_ms < opts.grace_period_ms {
            continue;
        }
        let (listing, event) = remove_listing(existing, opts, now_ms);
        out.listings.push(listing);
        out.events.push(event);
    }

    out
}

fn create_listing(
    source: &str,
    raw: &RawListing,
    snapshot: &FetchSnapshot,
    opts: &DiffOptions,
    now_ms: i64,
) -> (CanonicalListing, ChangeEvent) {
    let fields = tracked_values(raw, &opts.tracked_fields);
    let hash = field_hash(&opts.tracked_fields, &fields);

    let changed_fields = fields
        .iter()
        .map(|(name, value)| FieldChange {
            field: name.clone(),
            old_value: Value::Null,
            new_value: value.clone(),
            change_type: FieldChangeKind::Added,
            significance: 1.0,
        })
        .collect();

    let mut listing = CanonicalListing {
        source: source.to_string(),
        listing_id: raw.id.clone(),
        first_seen_at_ms: now_ms,
        last_seen_at_ms: now_ms,
        status: ListingStatus::Active,
        fields,
        image_urls: raw.image_urls.clone(),
        version: 1,
        field_hash: hash.clone(),
        etag: snapshot.etag.clone(),
        last_modified: snapshot.last_modified.clone(),
        tracked_fields: opts.tracked_fields.clone(),
        change_history: Vec::new(),
        raw_data: raw.to_raw_value(),
    };
    listing.push_history(ChangeRecord {
        at_ms: now_ms,
        event_type: EventType::Created,
        version: 1,
    });

    let event = draft_event(
        EventType::Created,
        &listing,
        changed_fields,
        None,
        hash,
        SignificanceBucket::High,
        1.0,
        opts,
        now_ms,
    );
    (listing, event)
}

fn revive_listing(
    existing: &CanonicalListing,
    raw: &RawListing,
    snapshot: &FetchSnapshot,
    opts: &DiffOptions,
    now_ms: i64,
) -> (CanonicalListing, ChangeEvent) {
    let fields = tracked_values(raw, &opts.tracked_fields);
    let hash = field_hash(&opts.tracked_fields, &fields);

    let mut listing = existing.clone();
    listing.status = ListingStatus::Active;
    listing.last_seen_at_ms = now_ms;
    listing.version += 1;
    listing.fields = fields;
    listing.field_hash = hash.clone();
    listing.image_urls = raw.image_urls.clone();
    listing.raw_data = raw.to_raw_value();
    listing.etag = snapshot.etag.clone();
    listing.last_modified = snapshot.last_modified.clone();
    listing.push_history(ChangeRecord {
        at_ms: now_ms,
        event_type: EventType::Created,
        version: listing.version,
    });

    let event = draft_event(
        EventType::Created,
        &listing,
        Vec::new(),
        Some(existing.field_hash.clone()),
        hash,
        SignificanceBucket::High,
        1.0,
        opts,
        now_ms,
    );
    (listing, event)
}

fn remove_listing(
    existing: &CanonicalListing,
    opts: &DiffOptions,
    now_ms: i64,
) -> (CanonicalListing, ChangeEvent) {
    let mut listing = existing.clone();
    listing.status = ListingStatus::Removed;
    // Removed listings carry their detection time as the last-seen stamp.
    listing.last_seen_at_ms = now_ms;
    listing.version += 1;
    listing.push_history(ChangeRecord {
        at_ms: now_ms,
        event_type: EventType::Removed,
        version: listing.version,
    });

    let event = draft_event(
        EventType::Removed,
        &listing,
        Vec::new(),
        Some(existing.field_hash.clone()),
        existing.field_hash.clone(),
        SignificanceBucket::High,
        1.0,
        opts,
        now_ms,
    );
    (listing, event)
}

fn update_listing(
    existing: &CanonicalListing,
    raw: &RawListing,
    snapshot: &FetchSnapshot,
    opts: &DiffOptions,
    now_ms: i64,
) -> (CanonicalListing, Option<ChangeEvent>) {
    let new_fields = tracked_values(raw, &opts.tracked_fields);
    let mut changes = Vec::new();

    for field in &opts.tracked_fields {
        if is_ignored(field, &opts.ignored_fields) {
            continue;
        }
        let old = existing.fields.get(field).cloned().unwrap_or(Value::Null);
        let new = new_fields.get(field).cloned().unwrap_or(Value::Null);
        if normalized_equal(&old, &new) {
            continue;
        }
        let change_type = match (&old, &new) {
            (Value::Null, _) => FieldChangeKind::Added,
            (_, Value::Null) => FieldChangeKind::Removed,
            _ => FieldChangeKind::Modified,
        };
        let significance = field_significance(field, &old, &new);
        changes.push(FieldChange {
            field: field.clone(),
            old_value: old,
            new_value: new,
            change_type,
            significance,
        });
    }

    let mut listing = existing.clone();
    listing.last_seen_at_ms = now_ms;
    listing.image_urls = raw.image_urls.clone();
    listing.raw_data = raw.to_raw_value();
    listing.etag = snapshot.etag.clone();
    listing.last_modified = snapshot.last_modified.clone();

    if changes.is_empty() {
        // Pure sighting refresh; tracked values are untouched and the
        // version stays put.
        return (listing, None);
    }

    let hash_before = existing.field_hash.clone();
    listing.fields = new_fields;
    listing.field_hash = field_hash(&opts.tracked_fields, &listing.fields);
    listing.version += 1;

    let max_sig = changes.iter().map(|c| c.significance).fold(0.0, f64::max);
    if max_sig < opts.min_significance {
        // Absorb the drift silently; no event below the floor.
        return (listing, None);
    }

    let mean_sig =
        changes.iter().map(|c| c.significance).sum::<f64>() / changes.len() as f64;
    let confidence = (mean_sig * 2.0).min(1.0);
    listing.push_history(ChangeRecord {
        at_ms: now_ms,
        event_type: EventType::Updated,
        version: listing.version,
    });

    let event = draft_event(
        EventType::Updated,
        &listing,
        changes,
        Some(hash_before),
        listing.field_hash.clone(),
        SignificanceBucket::from_score(max_sig),
        confidence,
        opts,
        now_ms,
    );
    (listing, Some(event))
}

#[allow(clippy::too_many_arguments)]
fn draft_event(
    event_type: EventType,
    listing: &CanonicalListing,
    changed_fields: Vec<FieldChange>,
    field_hash_before: Option<String>,
    field_hash_after: String,
    significance: SignificanceBucket,
    confidence: f64,
    opts: &DiffOptions,
    now_ms: i64,
) -> ChangeEvent {
    ChangeEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type,
        listing_id: listing.listing_id.clone(),
        source: listing.source.clone(),
        changed_fields,
        field_hash_before,
        field_hash_after,
        detected_at_ms: now_ms,
        version: listing.version,
        confidence,
        significance,
        metadata: opts.metadata.clone(),
        status: EventStatus::Pending,
        retry_count: 0,
        last_retry_at_ms: None,
    }
}

fn tracked_values(raw: &RawListing, tracked: &[String]) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for field in tracked {
        let value = raw.field(field);
        if value != Value::Null {
            out.insert(field.clone(), value);
        }
    }
    out
}

fn is_ignored(field: &str, patterns: &[String]) -> bool {
    let lower = field.to_ascii_lowercase();
    patterns
        .iter()
        .any(|p| !p.is_empty() && lower.contains(&p.to_ascii_lowercase()))
}

/// Lowercases, strips punctuation, and collapses whitespace.
pub fn normalize_text(s: &str) -> String {
    let lowered = s.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalized_equal(old: &Value, new: &Value) -> bool {
    match (old, new) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => normalize_text(a) == normalize_text(b),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        // Arrays element-wise, objects by canonical form; serde_json maps
        // are ordered so plain equality is canonical.
        _ => old == new,
    }
}

fn field_significance(field: &str, old: &Value, new: &Value) -> f64 {
    match field {
        "price" => match (old.as_f64(), new.as_f64()) {
            (Some(o), Some(n)) => {
                if o == 0.0 {
                    1.0
                } else {
                    ((n - o).abs() / o.abs()).min(1.0)
                }
            }
            _ => 0.1,
        },
        "title" => match (old.as_str(), new.as_str()) {
            (Some(o), Some(n)) => 1.0 - jaccard_similarity(o, n),
            _ => 0.1,
        },
        "condition" => 0.3,
        "location" => 0.2,
        _ => 0.1,
    }
}

fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_text(a);
    let nb = normalize_text(b);
    let sa: std::collections::HashSet<&str> = na.split_whitespace().collect();
    let sb: std::collections::HashSet<&str> = nb.split_whitespace().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> DiffOptions {
        DiffOptions {
            tracked_fields: vec![
                "condition".into(),
                "location".into(),
                "price".into(),
                "title".into(),
            ],
            ignored_fields: vec![],
            grace_period_ms: 300_000,
            min_significance: DEFAULT_MIN_SIGNIFICANCE,
            metadata: Value::Null,
        }
    }

    fn raw(id: &str, title: &str, price: i64) -> RawListing {
        RawListing {
            id: id.into(),
            title: Some(title.into()),
            price: Some(serde_json::Number::from(price)),
            condition: None,
            location: None,
            url: None,
            image_urls: vec![],
            extra: serde_json::Map::new(),
        }
    }

    fn snapshot(listings: Vec<RawListing>, full: bool) -> FetchSnapshot {
        FetchSnapshot {
            source: "https://market.example.com/search".into(),
            total_listings: listings.len(),
            first_page_ids: listings.iter().map(|l| l.id.clone()).collect(),
            listings,
            pages_scraped: 1,
            scraped_at_ms: 0,
            full,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn first_sighting_creates_with_high_significance() {
        let snap = snapshot(vec![raw("a", "X", 100)], true);
        let out = diff_snapshot(&snap, &[], &opts(), 1_000);

        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.event_type, EventType::Created);
        assert_eq!(ev.significance, SignificanceBucket::High);
        assert_eq!(ev.version, 1);
        assert!(ev.field_hash_before.is_none());

        let listing = &out.listings[0];
        assert_eq!(listing.version, 1);
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), json!("X"));
        fields.insert("price".to_string(), json!(100));
        assert_eq!(
            listing.field_hash,
            field_hash(&opts().tracked_fields, &fields)
        );
    }

    #[test]
    fn price_drop_scores_relative_delta() {
        let snap1 = snapshot(vec![raw("a", "X", 100)], true);
        let first = diff_snapshot(&snap1, &[], &opts(), 1_000);

        let snap2 = snapshot(vec![raw("a", "X", 80)], true);
        let out = diff_snapshot(&snap2, &first.listings, &opts(), 2_000);

        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.event_type, EventType::Updated);
        assert_eq!(ev.version, 2);
        assert_eq!(ev.changed_fields.len(), 1);
        let change = &ev.changed_fields[0];
        assert_eq!(change.field, "price");
        assert_eq!(change.old_value, json!(100));
        assert_eq!(change.new_value, json!(80));
        assert!((change.significance - 0.2).abs() < 1e-9);
        assert_eq!(ev.significance, SignificanceBucket::Low);
        assert!((ev.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn cosmetic_title_change_is_silent() {
        let snap1 = snapshot(vec![raw("a", "MacBook Pro 14", 100)], true);
        let first = diff_snapshot(&snap1, &[], &opts(), 1_000);

        let snap2 = snapshot(vec![raw("a", "  macbook  pro  14!  ", 100)], true);
        let out = diff_snapshot(&snap2, &first.listings, &opts(), 2_000);

        assert!(out.events.is_empty());
        // The sighting still refreshes last-seen without a version bump.
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].version, 1);
        assert_eq!(out.listings[0].last_seen_at_ms, 2_000);
    }

    #[test]
    fn identical_snapshots_are_idempotent() {
        let snap = snapshot(vec![raw("a", "X", 100), raw("b", "Y", 50)], true);
        let first = diff_snapshot(&snap, &[], &opts(), 1_000);
        let again = diff_snapshot(&snap, &first.listings, &opts(), 2_000);

        assert!(again.events.is_empty());
        for l in &again.listings {
            let prior = first
                .listings
                .iter()
                .find(|p| p.listing_id == l.listing_id)
                .unwrap();
            assert_eq!(l.version, prior.version);
            assert_eq!(l.field_hash, prior.field_hash);
        }
    }

    #[test]
    fn empty_canonical_applied_twice_yields_no_changes() {
        let snap = snapshot(vec![raw("a", "X", 100)], true);
        let first = diff_snapshot(&snap, &[], &opts(), 1_000);
        let second = diff_snapshot(&snap, &first.listings, &opts(), 1_000);
        assert!(second.events.is_empty());
    }

    #[test]
    fn removal_waits_for_grace_period() {
        let snap1 = snapshot(vec![raw("a", "X", 100)], true);
        let first = diff_snapshot(&snap1, &[], &opts(), 1_000);

        // Gone, but only 100s stale: suppressed.
        let gone = snapshot(vec![], true);
        let out = diff_snapshot(&gone, &first.listings, &opts(), 101_000);
        assert!(out.events.is_empty());
        assert!(out.listings.is_empty());

        // Past the grace period: removal confirmed.
        let out = diff_snapshot(&gone, &first.listings, &opts(), 1_000 + 300_000);
        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.event_type, EventType::Removed);
        assert_eq!(ev.version, 2);
        let listing = &out.listings[0];
        assert_eq!(listing.status, ListingStatus::Removed);
        assert_eq!(listing.last_seen_at_ms, 1_000 + 300_000);
    }

    #[test]
    fn partial_fetch_never_confirms_removal() {
        let snap1 = snapshot(vec![raw("a", "X", 100)], true);
        let first = diff_snapshot(&snap1, &[], &opts(), 1_000);

        let gone = snapshot(vec![], false);
        let out = diff_snapshot(&gone, &first.listings, &opts(), 10_000_000);
        assert!(out.events.is_empty());
    }

    #[test]
    fn relisting_revives_with_growing_version() {
        let snap1 = snapshot(vec![raw("a", "X", 100)], true);
        let first = diff_snapshot(&snap1, &[], &opts(), 1_000);

        let gone = snapshot(vec![], true);
        let removed = diff_snapshot(&gone, &first.listings, &opts(), 400_000);
        assert_eq!(removed.listings[0].status, ListingStatus::Removed);

        let back = snapshot(vec![raw("a", "X", 100)], true);
        let out = diff_snapshot(&back, &removed.listings, &opts(), 500_000);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].event_type, EventType::Created);
        assert_eq!(out.events[0].version, 3);
        assert_eq!(out.listings[0].status, ListingStatus::Active);
    }

    #[test]
    fn field_dropped_from_snapshot_is_field_level_removal() {
        let mut with_condition = raw("a", "X", 100);
        with_condition.condition = Some("good".into());
        let first = diff_snapshot(&snapshot(vec![with_condition], true), &[], &opts(), 1_000);

        let out = diff_snapshot(
            &snapshot(vec![raw("a", "X", 100)], true),
            &first.listings,
            &opts(),
            2_000,
        );
        assert_eq!(out.events.len(), 1);
        let ev = &out.events[0];
        assert_eq!(ev.event_type, EventType::Updated);
        let change = ev
            .changed_fields
            .iter()
            .find(|c| c.field == "condition")
            .unwrap();
        assert_eq!(change.change_type, FieldChangeKind::Removed);
        assert!((change.significance - 0.3).abs() < 1e-9);
    }

    #[test]
    fn ignored_fields_are_skipped() {
        let mut o = opts();
        o.ignored_fields = vec!["price".into()];
        let first = diff_snapshot(&snapshot(vec![raw("a", "X", 100)], true), &[], &o, 1_000);
        let out = diff_snapshot(
            &snapshot(vec![raw("a", "X", 50)], true),
            &first.listings,
            &o,
            2_000,
        );
        assert!(out.events.is_empty());
    }

    #[test]
    fn zero_old_price_is_maximally_significant() {
        assert_eq!(field_significance("price", &json!(0), &json!(10)), 1.0);
    }

    #[test]
    fn title_significance_uses_token_jaccard() {
        // "macbook pro 14" vs "macbook pro 16": 2 shared of 4 tokens.
        let sig = field_significance("title", &json!("MacBook Pro 14"), &json!("MacBook Pro 16"));
        assert!((sig - 0.5).abs() < 1e-9);
    }

    #[test]
    fn normalize_collapses_case_spacing_and_punctuation() {
        assert_eq!(normalize_text("  MacBook,  PRO!! 14  "), "macbook pro 14");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_listing() -> impl Strategy<Value = RawListing> {
            ("[a-z]{1,8}", "[A-Za-z0-9 ]{0,20}", 0i64..100_000).prop_map(|(id, title, price)| {
                RawListing {
                    id,
                    title: Some(title),
                    price: Some(serde_json::Number::from(price)),
                    condition: None,
                    location: None,
                    url: None,
                    image_urls: vec![],
                    extra: serde_json::Map::new(),
                }
            })
        }

        proptest! {
            /// Applying a snapshot to the canonical set it just produced
            /// yields no further changes.
            #[test]
            fn prop_diff_is_idempotent(listings in proptest::collection::vec(arb_listing(), 0..8)) {
                let snap = snapshot(listings, true);
                let first = diff_snapshot(&snap, &[], &opts(), 1_000);
                let second = diff_snapshot(&snap, &first.listings, &opts(), 2_000);
                prop_assert!(second.events.is_empty());
                for l in &second.listings {
                    let prior = first
                        .listings
                        .iter()
                        .find(|p| p.listing_id == l.listing_id)
                        .expect("listing survives");
                    prop_assert_eq!(l.version, prior.version);
                }
            }
        }
    }
}
