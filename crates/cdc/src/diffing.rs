//! Diff events derived from version rows.
//!
//! The CDC listener does not ship raw row images downstream; it resolves the
//! metric's latest version diff and flattens it into per-key changes so the
//! debounce merge can work at property granularity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One key-level change inside a diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChangeValue {
    Set {
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        property_type: Option<String>,
        value: serde_json::Value,
    },
    Removed {
        removed: bool,
    },
}

impl ChangeValue {
    pub fn set(property_type: Option<String>, value: serde_json::Value) -> Self {
        Self::Set {
            property_type,
            value,
        }
    }

    pub fn removed() -> Self {
        Self::Removed { removed: true }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed { .. })
    }
}

/// A single change emitted from replication, attributed to a version row.
#[derive(Debug, Clone)]
pub struct DiffEvent {
    /// `"<metric_key>:<version>"` — replaying the same version row is a
    /// duplicate and is dropped.
    pub event_id: String,
    pub metric_key: i64,
    pub uns_path: String,
    pub canary_id: String,
    pub version: i64,
    pub actor: String,
    pub changes: BTreeMap<String, ChangeValue>,
    pub changed_at: DateTime<Utc>,
    pub lsn: u64,
}

/// Flatten a version diff document into per-key changes.
///
/// `{properties: {key: {type, old?, new} | {removed: true}}}` becomes one
/// change per property key; a `path` block becomes a `path` change carrying
/// the new canonical path.
pub fn flatten_version_diff(diff: &serde_json::Value) -> BTreeMap<String, ChangeValue> {
    let mut out = BTreeMap::new();

    if let Some(path) = diff.get("path") {
        if let Some(new_path) = path.get("new") {
            out.insert(
                "path".to_string(),
                ChangeValue::set(None, new_path.clone()),
            );
        }
    }

    if let Some(serde_json::Value::Object(properties)) = diff.get("properties") {
        for (key, entry) in properties {
            if entry.get("removed").and_then(|v| v.as_bool()) == Some(true) {
                out.insert(key.clone(), ChangeValue::removed());
                continue;
            }
            let Some(new_value) = entry.get("new") else {
                continue;
            };
            let property_type = entry
                .get("type")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            out.insert(
                key.clone(),
                ChangeValue::set(property_type, new_value.clone()),
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_covers_updates_removals_and_renames() {
        let diff = serde_json::json!({
            "path": {"old": "A/B/C", "new": "A/B/D"},
            "properties": {
                "displayHigh": {"type": "int", "old": 1800, "new": 2000},
                "engUnit": {"type": "string", "new": "°C"},
                "stale": {"removed": true}
            }
        });
        let changes = flatten_version_diff(&diff);
        assert_eq!(changes.len(), 4);
        assert_eq!(
            changes["displayHigh"],
            ChangeValue::set(Some("int".into()), serde_json::json!(2000))
        );
        assert_eq!(changes["path"], ChangeValue::set(None, serde_json::json!("A/B/D")));
        assert!(changes["stale"].is_removed());
    }

    #[test]
    fn empty_diff_flattens_to_nothing() {
        assert!(flatten_version_diff(&serde_json::json!({})).is_empty());
    }
}
