use chrono::{DateTime, Utc};
use std::hash::{Hash, Hasher};

/// Deterministic string hash used for shard routing. `DefaultHasher::new()`
/// is keyed with constants, so the mapping holds for the process lifetime.
pub fn stable_hash(value: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

pub fn shard_index(key: &str, instances: usize) -> usize {
    (stable_hash(key) % instances.max(1) as u64) as usize
}

/// Collection suffix from a packet timestamp (microseconds, UTC). Bucketing
/// follows the packet's own time so late arrivals land in their historical
/// bucket.
pub fn time_suffix(timestamp_micros: u64, format: &str) -> String {
    let dt: DateTime<Utc> =
        DateTime::from_timestamp_micros(timestamp_micros as i64).unwrap_or_default();
    dt.format(format).to_string()
}

pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '~' | ',' | '|' | '.' | '/' | '[' | '{' | '}' | ']' | '=' | '&' | '%' | '$' | '\\'
            | '"' | '\'' | '`' | '<' | '>' | '?' | ':' | ';' | '*' | '+' | '#' => '_',
            _ => c,
        })
        .collect()
}
