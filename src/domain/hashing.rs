//! Content hashing for canonical listings: SHA-256 over the tracked-field
//! subset serialized as JSON with lexicographically sorted keys.
use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes the tracked-field subset deterministically. Every tracked key
/// is present in the output; fields the listing does not carry serialize as
/// `null`. `serde_json` maps are BTreeMap-backed, so keys come out sorted.
pub fn canonical_tracked_json(tracked: &[String], fields: &BTreeMap<String, Value>) -> String {
    let mut map = serde_json::Map::new();
    for key in tracked {
        let value = fields.get(key).cloned().unwrap_or(Value::Null);
        map.insert(key.clone(), value);
    }
    Value::Object(map).to_string()
}

/// Hash identity of a listing's tracked fields. Pure: two listings with the
/// same tracked values always hash the same.
pub fn field_hash(tracked: &[String], fields: &BTreeMap<String, Value>) -> String {
    sha256_hex(canonical_tracked_json(tracked, fields).as_bytes())
}
