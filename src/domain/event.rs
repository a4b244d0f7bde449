//! Change events: the outbox rows produced by the diff engine and drained
//! by the dispatcher.
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Created,
    Updated,
    Removed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Updated => "UPDATED",
            EventType::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(EventType::Created),
            "UPDATED" => Some(EventType::Updated),
            "REMOVED" => Some(EventType::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldChangeKind {
    Added,
    Modified,
    Removed,
}

impl FieldChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldChangeKind::Added => "ADDED",
            FieldChangeKind::Modified => "MODIFIED",
            FieldChangeKind::Removed => "REMOVED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub change_type: FieldChangeKind,
    pub significance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignificanceBucket {
    Low,
    Medium,
    High,
}

impl SignificanceBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignificanceBucket::Low => "LOW",
            SignificanceBucket::Medium => "MEDIUM",
            SignificanceBucket::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(SignificanceBucket::Low),
            "MEDIUM" => Some(SignificanceBucket::Medium),
            "HIGH" => Some(SignificanceBucket::High),
            _ => None,
        }
    }

    /// Buckets the strongest per-field significance of an event.
    pub fn from_score(max_significance: f64) -> Self {
        if max_significance > 0.5 {
            SignificanceBucket::High
        } else if max_significance > 0.2 {
            SignificanceBucket::Medium
        } else {
            SignificanceBucket::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Pending,
    InFlight,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::InFlight => "IN_FLIGHT",
            EventStatus::Processed => "PROCESSED",
            EventStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EventStatus::Pending),
            "IN_FLIGHT" => Some(EventStatus::InFlight),
            "PROCESSED" => Some(EventStatus::Processed),
            "FAILED" => Some(EventStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub listing_id: String,
    pub source: String,
    pub changed_fields: Vec<FieldChange>,
    pub field_hash_before: Option<String>,
    pub field_hash_after: String,
    pub detected_at_ms: i64,
    /// Listing version after the change; strictly increasing per listing.
    pub version: i64,
    pub confidence: f64,
    pub significance: SignificanceBucket,
    pub metadata: Value,
    pub status: EventStatus,
    pub retry_count: u32,
    pub last_retry_at_ms: Option<i64>,
}

impl ChangeEvent {
    /// Canonical JSON body POSTed to webhook subscribers. Keys are sorted
    /// lexicographically so a subscriber replaying the HMAC over the exact
    /// received body obtains the same digest.
    pub fn webhook_payload(&self, now_ms: i64) -> String {
        let changed: Vec<Value> = self
            .changed_fields
            .iter()
            .map(|c| {
                serde_json::json!({
                    "field": c.field,
                    "oldValue": c.old_value,
                    "newValue": c.new_value,
                    "changeType": c.change_type.as_str(),
                    "significance": c.significance,
                })
            })
            .collect();

        serde_json::json!({
            "eventId": self.event_id,
            "eventType": self.event_type.as_str(),
            "listingId": self.listing_id,
            "source": self.source,
            "changedFields": changed,
            "fieldHashBefore": self.field_hash_before,
            "fieldHashAfter": self.field_hash_after,
            "detectedAt": rfc3339(self.detected_at_ms),
            "version": self.version,
            "confidence": self.confidence,
            "significance": self.significance.as_str(),
            "metadata": self.metadata,
            "timestamp": rfc3339(now_ms),
        })
        .to_string()
    }
}

fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> ChangeEvent {
        ChangeEvent {
            event_id: "e1".into(),
            event_type: EventType::Updated,
            listing_id: "a".into(),
            source: "https://market.example.com/search".into(),
            changed_fields: vec![FieldChange {
                field: "price".into(),
                old_value: serde_json::json!(100),
                new_value: serde_json::json!(80),
                change_type: FieldChangeKind::Modified,
                significance: 0.2,
            }],
            field_hash_before: Some("aa".into()),
            field_hash_after: "bb".into(),
            detected_at_ms: 1_700_000_000_000,
            version: 2,
            confidence: 0.4,
            significance: SignificanceBucket::Low,
            metadata: Value::Null,
            status: EventStatus::Pending,
            retry_count: 0,
            last_retry_at_ms: None,
        }
    }

    #[test]
    fn payload_keys_are_sorted() {
        // Empty change list so nested keys cannot shadow the top-level probe.
        let mut ev = event();
        ev.changed_fields.clear();
        let body = ev.webhook_payload(1_700_000_000_000);
        let top_level = [
            "changedFields",
            "confidence",
            "detectedAt",
            "eventId",
            "eventType",
            "fieldHashAfter",
            "fieldHashBefore",
            "listingId",
            "metadata",
            "significance",
            "source",
            "timestamp",
            "version",
        ];
        let mut last = 0;
        for key in top_level {
            let pos = body
                .find(&format!("\"{key}\""))
                .unwrap_or_else(|| panic!("missing key {key}"));
            assert!(pos > last || last == 0, "key {key} out of order");
            last = pos;
        }
    }

    #[test]
    fn payload_is_stable_for_equal_inputs() {
        let a = event().webhook_payload(42);
        let b = event().webhook_payload(42);
        assert_eq!(a, b);
    }

    #[test]
    fn detected_at_renders_rfc3339() {
        let body = event().webhook_payload(0);
        assert!(body.contains("\"detectedAt\":\"2023-11-14T22:13:20.000Z\""));
    }

    #[test]
    fn bucket_thresholds() {
        assert_eq!(SignificanceBucket::from_score(0.2), SignificanceBucket::Low);
        assert_eq!(
            SignificanceBucket::from_score(0.21),
            SignificanceBucket::Medium
        );
        assert_eq!(SignificanceBucket::from_score(0.51), SignificanceBucket::High);
    }
}
