//! Egress payload mapping.
//!
//! Aggregated diffs become property-write payloads:
//! `{sessionToken, properties: {<canary_id>: [[timestamp, "key=value", 192], …]}}`.
//! Batches group a bounded number of tags, split further when the encoded
//! size exceeds the byte limit, and carry a content-derived idempotency key
//! so retries of the same logical batch deduplicate at the historian.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use sync_core::Error;

use cdc::{AggregatedDiff, ChangeValue};

/// Fixed quality marker for "good" on property-only writes.
pub const QUALITY_GOOD: i64 = 192;

/// One mapped batch ready to send.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    /// `properties` object of the write payload.
    pub properties: Value,
    /// Stable content hash carried on every attempt of this batch.
    pub idempotency_key: String,
    /// Replication positions settled when this batch settles.
    pub lsns: Vec<u64>,
    /// Source diffs, retained for dead-letter records.
    pub diffs: Vec<AggregatedDiff>,
}

impl WriteBatch {
    pub fn tag_count(&self) -> usize {
        self.diffs.len()
    }

    /// Full request body with the session token injected at send time.
    pub fn body(&self, session_token: &str) -> Value {
        json!({
            "sessionToken": session_token,
            "properties": self.properties,
        })
    }
}

/// Maps aggregated diffs into bounded write batches.
pub struct PayloadMapper {
    max_batch_tags: usize,
    max_payload_bytes: usize,
}

impl PayloadMapper {
    pub fn new(max_batch_tags: usize, max_payload_bytes: usize) -> Self {
        Self {
            max_batch_tags: max_batch_tags.max(1),
            max_payload_bytes: max_payload_bytes.max(1),
        }
    }

    /// Build batches from the given diffs at the given emit time.
    ///
    /// Returns the batches plus diffs that could not be mapped (a single
    /// diff larger than the payload limit is dead-letter-eligible, never
    /// retried).
    pub fn build_batches(
        &self,
        diffs: Vec<AggregatedDiff>,
        now: DateTime<Utc>,
    ) -> (Vec<WriteBatch>, Vec<(AggregatedDiff, Error)>) {
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut batches = Vec::new();
        let mut rejected = Vec::new();
        let mut current: Vec<(AggregatedDiff, Value)> = Vec::new();
        let mut current_bytes = 0usize;

        for diff in diffs {
            let entries = diff_entries(&diff, &timestamp);
            if entries_is_empty(&entries) {
                continue;
            }
            let entry_bytes = encoded_len(&diff.canary_id, &entries);
            if entry_bytes > self.max_payload_bytes {
                rejected.push((
                    diff,
                    Error::PayloadTooLarge {
                        size: entry_bytes,
                        limit: self.max_payload_bytes,
                    },
                ));
                continue;
            }

            let over_tags = current.len() >= self.max_batch_tags;
            let over_bytes = current_bytes + entry_bytes > self.max_payload_bytes;
            if !current.is_empty() && (over_tags || over_bytes) {
                batches.push(self.seal(std::mem::take(&mut current)));
                current_bytes = 0;
            }
            current_bytes += entry_bytes;
            current.push((diff, entries));
        }

        if !current.is_empty() {
            batches.push(self.seal(current));
        }
        (batches, rejected)
    }

    fn seal(&self, entries: Vec<(AggregatedDiff, Value)>) -> WriteBatch {
        let mut properties = serde_json::Map::new();
        let mut lsns = Vec::with_capacity(entries.len());
        let mut diffs = Vec::with_capacity(entries.len());
        for (diff, entry) in entries {
            properties.insert(diff.canary_id.clone(), entry);
            lsns.push(diff.max_lsn);
            diffs.push(diff);
        }
        let idempotency_key = idempotency_key(&diffs);
        WriteBatch {
            properties: Value::Object(properties),
            idempotency_key,
            lsns,
            diffs,
        }
    }
}

/// `[[timestamp, "key=value", quality], …]` for one diff; only keys that
/// actually changed are included.
fn diff_entries(diff: &AggregatedDiff, timestamp: &str) -> Value {
    let entries: Vec<Value> = diff
        .changes
        .iter()
        .map(|(key, change)| {
            json!([timestamp, format!("{key}={}", render_change(change)), QUALITY_GOOD])
        })
        .collect();
    Value::Array(entries)
}

fn entries_is_empty(entries: &Value) -> bool {
    entries.as_array().is_none_or(|a| a.is_empty())
}

/// Render a change value for the `key=value` wire form. Strings pass
/// through unquoted; removals carry an empty value.
fn render_change(change: &ChangeValue) -> String {
    match change {
        ChangeValue::Removed { .. } => String::new(),
        ChangeValue::Set { value, .. } => match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        },
    }
}

fn encoded_len(canary_id: &str, entries: &Value) -> usize {
    // Key, quotes, colon, plus the encoded entry array.
    canary_id.len() + 3 + serde_json::to_string(entries).map(|s| s.len()).unwrap_or(0)
}

/// Stable content hash over sorted canary ids and their sorted key=value
/// pairs. Replaying the same logical batch yields the same key; a fresh
/// UUID per attempt would defeat historian-side deduplication.
fn idempotency_key(diffs: &[AggregatedDiff]) -> String {
    let mut ids: Vec<&str> = diffs.iter().map(|d| d.canary_id.as_str()).collect();
    ids.sort_unstable();

    let mut pairs: Vec<String> = diffs
        .iter()
        .flat_map(|diff| {
            diff.changes
                .iter()
                .map(|(key, change)| format!("{}|{key}={}", diff.canary_id, render_change(change)))
        })
        .collect();
    pairs.sort_unstable();

    let mut hasher = crc32fast::Hasher::new();
    for id in &ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:08x}", hasher.finalize())
}
