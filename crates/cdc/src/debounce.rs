//! Per-metric debounce buffer.
//!
//! Changes for one metric are merged for a time window before emission so a
//! burst of edits collapses into a single downstream write. One monotonic
//! clock and a periodic sweep replace per-key timers; entries flush in
//! first-seen order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use telemetry::metrics;
use tracing::warn;

use crate::diffing::{ChangeValue, DiffEvent};

/// Merged, flush-ready view of one metric's buffered changes.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedDiff {
    pub metric_key: i64,
    pub uns_path: String,
    pub canary_id: String,
    /// Versions merged into this diff, ascending.
    pub versions: Vec<i64>,
    pub latest_actor: String,
    /// Per-key last-write-wins merge; deletions override prior updates.
    pub changes: BTreeMap<String, ChangeValue>,
    pub event_ids: BTreeSet<String>,
    /// Highest replication position contributing to this diff; the resume
    /// token may not pass it until egress settles.
    pub max_lsn: u64,
    /// Seconds between the first and last buffered change.
    pub span_seconds: f64,
}

#[derive(Debug)]
struct DebounceEntry {
    metric_key: i64,
    uns_path: String,
    canary_id: String,
    first_seen: Instant,
    last_update: Instant,
    seq: u64,
    versions: Vec<i64>,
    latest_version: i64,
    latest_actor: String,
    changes: BTreeMap<String, ChangeValue>,
    event_ids: BTreeSet<String>,
    min_lsn: u64,
    max_lsn: u64,
}

impl DebounceEntry {
    fn merge(&mut self, event: &DiffEvent, now: Instant) {
        for (key, value) in &event.changes {
            self.changes.insert(key.clone(), value.clone());
        }
        self.versions.push(event.version);
        if event.version >= self.latest_version {
            self.latest_version = event.version;
            self.latest_actor = event.actor.clone();
        }
        self.event_ids.insert(event.event_id.clone());
        self.last_update = now;
        self.min_lsn = self.min_lsn.min(event.lsn);
        self.max_lsn = self.max_lsn.max(event.lsn);
    }

    fn into_aggregated(mut self) -> AggregatedDiff {
        self.versions.sort_unstable();
        self.versions.dedup();
        AggregatedDiff {
            metric_key: self.metric_key,
            uns_path: self.uns_path,
            canary_id: self.canary_id,
            versions: self.versions,
            latest_actor: self.latest_actor,
            changes: self.changes,
            event_ids: self.event_ids,
            max_lsn: self.max_lsn,
            span_seconds: self
                .last_update
                .duration_since(self.first_seen)
                .as_secs_f64(),
        }
    }
}

/// Bounded per-metric aggregation with time-window flush.
pub struct DebounceBuffer {
    window: Duration,
    cap: usize,
    entries: HashMap<i64, DebounceEntry>,
    next_seq: u64,
}

impl DebounceBuffer {
    pub fn new(window: Duration, cap: usize) -> Self {
        assert!(!window.is_zero(), "debounce window must be positive");
        assert!(cap > 0, "debounce capacity must be positive");
        Self {
            window,
            cap,
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Lowest replication position still held by a buffered entry.
    pub fn min_buffered_lsn(&self) -> Option<u64> {
        self.entries.values().map(|entry| entry.min_lsn).min()
    }

    /// Merge one change. Returns `false` when the buffer is at capacity and
    /// the metric has no existing entry (the change is dropped with a
    /// counter increment; existing entries keep accepting merges).
    pub fn add(&mut self, event: &DiffEvent, now: Instant) -> bool {
        if !self.entries.contains_key(&event.metric_key) {
            if self.entries.len() >= self.cap {
                metrics().debounce_dropped.inc();
                warn!(
                    metric_key = event.metric_key,
                    depth = self.entries.len(),
                    "debounce buffer full; dropping change for new metric"
                );
                return false;
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.insert(
                event.metric_key,
                DebounceEntry {
                    metric_key: event.metric_key,
                    uns_path: event.uns_path.clone(),
                    canary_id: event.canary_id.clone(),
                    first_seen: now,
                    last_update: now,
                    seq,
                    versions: Vec::new(),
                    latest_version: i64::MIN,
                    latest_actor: String::new(),
                    changes: BTreeMap::new(),
                    event_ids: BTreeSet::new(),
                    min_lsn: event.lsn,
                    max_lsn: event.lsn,
                },
            );
        }
        let entry = self.entries.get_mut(&event.metric_key).expect("just inserted");
        // A rename observed mid-window redirects the whole diff to the new
        // identity.
        entry.uns_path = event.uns_path.clone();
        entry.canary_id = event.canary_id.clone();
        entry.merge(event, now);
        metrics().debounce_depth.set(self.entries.len() as u64);
        true
    }

    /// Emit entries whose window has elapsed, in first-seen order (ties by
    /// metric key).
    pub fn flush_expired(&mut self, now: Instant) -> Vec<AggregatedDiff> {
        let mut ready: Vec<(u64, i64)> = self
            .entries
            .values()
            .filter(|entry| now.duration_since(entry.first_seen) >= self.window)
            .map(|entry| (entry.seq, entry.metric_key))
            .collect();
        ready.sort_unstable();
        self.take(ready)
    }

    /// Emit everything regardless of age; used on shutdown.
    pub fn drain(&mut self) -> Vec<AggregatedDiff> {
        let mut all: Vec<(u64, i64)> = self
            .entries
            .values()
            .map(|entry| (entry.seq, entry.metric_key))
            .collect();
        all.sort_unstable();
        self.take(all)
    }

    fn take(&mut self, keys: Vec<(u64, i64)>) -> Vec<AggregatedDiff> {
        let emitted: Vec<AggregatedDiff> = keys
            .into_iter()
            .filter_map(|(_, metric_key)| self.entries.remove(&metric_key))
            .map(DebounceEntry::into_aggregated)
            .collect();
        if !emitted.is_empty() {
            metrics().debounce_emitted.inc_by(emitted.len() as u64);
            metrics().debounce_depth.set(self.entries.len() as u64);
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(metric_key: i64, version: i64, lsn: u64, changes: &[(&str, ChangeValue)]) -> DiffEvent {
        DiffEvent {
            event_id: format!("{metric_key}:{version}"),
            metric_key,
            uns_path: format!("Secil/EdgeA/DeviceA/M{metric_key}"),
            canary_id: format!("Secil.EdgeA.DeviceA.M{metric_key}"),
            version,
            actor: "uns-metadata-sync".into(),
            changes: changes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            changed_at: Utc::now(),
            lsn,
        }
    }

    fn set(value: serde_json::Value) -> ChangeValue {
        ChangeValue::set(Some("int".into()), value)
    }

    #[test]
    fn merge_is_last_write_wins_per_key() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(180), 10);
        let start = Instant::now();

        buffer.add(
            &event(1, 1, 100, &[("displayHigh", set(serde_json::json!(1800)))]),
            start,
        );
        buffer.add(
            &event(1, 2, 101, &[("displayHigh", set(serde_json::json!(2000)))]),
            start + Duration::from_secs(1),
        );
        buffer.add(
            &event(1, 3, 102, &[("engUnit", ChangeValue::removed())]),
            start + Duration::from_secs(2),
        );

        // Not yet expired.
        assert!(buffer.flush_expired(start + Duration::from_secs(10)).is_empty());

        let flushed = buffer.flush_expired(start + Duration::from_secs(180));
        assert_eq!(flushed.len(), 1);
        let diff = &flushed[0];
        assert_eq!(diff.changes["displayHigh"], set(serde_json::json!(2000)));
        assert!(diff.changes["engUnit"].is_removed());
        assert_eq!(diff.versions, vec![1, 2, 3]);
        assert_eq!(diff.max_lsn, 102);

        // Re-flushing without new adds emits nothing.
        assert!(buffer
            .flush_expired(start + Duration::from_secs(400))
            .is_empty());
    }

    #[test]
    fn deletion_overrides_prior_update_on_same_key() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(1), 10);
        let start = Instant::now();
        buffer.add(&event(1, 1, 1, &[("limit", set(serde_json::json!(5)))]), start);
        buffer.add(&event(1, 2, 2, &[("limit", ChangeValue::removed())]), start);
        let flushed = buffer.flush_expired(start + Duration::from_secs(2));
        assert!(flushed[0].changes["limit"].is_removed());
    }

    #[test]
    fn flush_preserves_first_seen_order() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(1), 10);
        let start = Instant::now();
        buffer.add(&event(30, 1, 1, &[("a", set(serde_json::json!(1)))]), start);
        buffer.add(
            &event(10, 1, 2, &[("a", set(serde_json::json!(1)))]),
            start + Duration::from_millis(5),
        );
        buffer.add(
            &event(20, 1, 3, &[("a", set(serde_json::json!(1)))]),
            start + Duration::from_millis(10),
        );

        let flushed = buffer.flush_expired(start + Duration::from_secs(2));
        let keys: Vec<i64> = flushed.iter().map(|d| d.metric_key).collect();
        assert_eq!(keys, vec![30, 10, 20]);
    }

    #[test]
    fn full_buffer_drops_new_keys_but_merges_existing() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(1), 2);
        let start = Instant::now();
        assert!(buffer.add(&event(1, 1, 1, &[("a", set(serde_json::json!(1)))]), start));
        assert!(buffer.add(&event(2, 1, 2, &[("a", set(serde_json::json!(1)))]), start));
        // New key at capacity is dropped.
        assert!(!buffer.add(&event(3, 1, 3, &[("a", set(serde_json::json!(1)))]), start));
        // Existing key still merges.
        assert!(buffer.add(&event(1, 2, 4, &[("b", set(serde_json::json!(2)))]), start));
        assert_eq!(buffer.depth(), 2);
    }

    #[test]
    fn min_buffered_lsn_tracks_oldest_change() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(1), 10);
        let start = Instant::now();
        assert_eq!(buffer.min_buffered_lsn(), None);
        buffer.add(&event(1, 1, 500, &[("a", set(serde_json::json!(1)))]), start);
        buffer.add(&event(2, 1, 300, &[("a", set(serde_json::json!(1)))]), start);
        assert_eq!(buffer.min_buffered_lsn(), Some(300));
        buffer.drain();
        assert_eq!(buffer.min_buffered_lsn(), None);
    }

    #[test]
    fn drain_emits_everything() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(600), 10);
        let start = Instant::now();
        buffer.add(&event(1, 1, 1, &[("a", set(serde_json::json!(1)))]), start);
        buffer.add(&event(2, 1, 2, &[("a", set(serde_json::json!(1)))]), start);
        assert_eq!(buffer.drain().len(), 2);
        assert_eq!(buffer.depth(), 0);
    }
}
