//! Logical-replication plumbing: change decoding and the slot-backed stream.
//!
//! Changes arrive as wal2json documents read through the SQL interface
//! (`pg_logical_slot_peek_changes`). Peeking keeps the read non-destructive;
//! the slot is only advanced once the checkpoint logic confirms a position.
//! Tests provide scripted streams through the same trait.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sync_core::{Error, Result};
use tracing::{debug, info};

use crate::checkpoint::{format_lsn, parse_lsn};

/// Row-level change kinds carried by the publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert" | "I" => Some(Self::Insert),
            "update" | "U" => Some(Self::Update),
            "delete" | "D" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Structured representation of one decoded change.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub relation: String,
    /// `metric_key` extracted from the new row image, falling back to the
    /// old-key image for deletes.
    pub metric_key: Option<i64>,
    pub lsn: u64,
}

/// A raw message from the replication slot.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub lsn: u64,
    pub data: String,
}

/// Transport over the replication slot.
#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Read up to `max_messages` undelivered messages without consuming
    /// them.
    async fn fetch(&self, max_messages: i64) -> Result<Vec<StreamMessage>>;

    /// Advance the slot's confirmed position; messages at or below `lsn`
    /// will not be served again.
    async fn advance(&self, lsn: u64) -> Result<()>;
}

/// Slot-backed stream over the wal2json SQL interface.
pub struct SqlChangeStream {
    pool: PgPool,
    slot_name: String,
    publication: String,
    /// wal2json `add-tables` filter resolved from the publication.
    add_tables: parking_lot::RwLock<String>,
}

impl SqlChangeStream {
    pub fn new(pool: PgPool, slot_name: impl Into<String>, publication: impl Into<String>) -> Self {
        Self {
            pool,
            slot_name: slot_name.into(),
            publication: publication.into(),
            add_tables: parking_lot::RwLock::new(
                "uns_meta.metrics,uns_meta.metric_properties".to_string(),
            ),
        }
    }

    /// Create the logical slot when absent and resolve the publication's
    /// table set. Slots are single-consumer; this service assumes it is the
    /// only reader.
    pub async fn ensure_slot(&self) -> Result<()> {
        let exists: Option<(String,)> = sqlx::query_as(
            "SELECT slot_name::text FROM pg_replication_slots WHERE slot_name = $1",
        )
        .bind(&self.slot_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| Error::transient(format!("slot lookup failed: {err}")))?;

        if exists.is_none() {
            sqlx::query("SELECT pg_create_logical_replication_slot($1, 'wal2json')")
                .bind(&self.slot_name)
                .execute(&self.pool)
                .await
                .map_err(|err| Error::transient(format!("slot creation failed: {err}")))?;
            info!(slot = %self.slot_name, "created logical replication slot");
        }

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT schemaname || '.' || tablename FROM pg_publication_tables \
             WHERE pubname = $1 ORDER BY tablename",
        )
        .bind(&self.publication)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::transient(format!("publication lookup failed: {err}")))?;
        if !tables.is_empty() {
            let filter: Vec<String> = tables.into_iter().map(|(name,)| name).collect();
            *self.add_tables.write() = filter.join(",");
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeStream for SqlChangeStream {
    async fn fetch(&self, max_messages: i64) -> Result<Vec<StreamMessage>> {
        let add_tables = self.add_tables.read().clone();
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
             'format-version', '2', 'add-tables', $3)",
        )
        .bind(&self.slot_name)
        .bind(max_messages)
        .bind(add_tables)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| Error::transient(format!("replication fetch failed: {err}")))?;

        rows.into_iter()
            .map(|(lsn, data)| Ok(StreamMessage { lsn: parse_lsn(&lsn)?, data }))
            .collect()
    }

    async fn advance(&self, lsn: u64) -> Result<()> {
        sqlx::query("SELECT pg_replication_slot_advance($1, $2::pg_lsn)")
            .bind(&self.slot_name)
            .bind(format_lsn(lsn))
            .execute(&self.pool)
            .await
            .map_err(|err| Error::transient(format!("slot advance failed: {err}")))?;
        debug!(slot = %self.slot_name, lsn = %format_lsn(lsn), "replication slot advanced");
        Ok(())
    }
}

/// Decode one wal2json document into change records.
///
/// Handles both format-version 2 (one action object per message) and
/// format-version 1 (`{"change": [...]}` batches).
pub fn decode_message(message: &StreamMessage) -> Result<Vec<ChangeRecord>> {
    let payload: Value = serde_json::from_str(&message.data)
        .map_err(|err| Error::malformed(format!("replication payload is not valid JSON: {err}")))?;

    let mut records = Vec::new();
    match &payload {
        Value::Object(object) if object.contains_key("change") => {
            if let Some(Value::Array(changes)) = object.get("change") {
                for change in changes {
                    if let Some(record) = decode_v1_change(change, message.lsn) {
                        records.push(record);
                    }
                }
            }
        }
        Value::Object(object) if object.contains_key("action") => {
            if let Some(record) = decode_v2_action(object, message.lsn) {
                records.push(record);
            }
        }
        _ => {}
    }
    Ok(records)
}

fn decode_v1_change(change: &Value, lsn: u64) -> Option<ChangeRecord> {
    let kind = ChangeKind::parse(change.get("kind")?.as_str()?)?;
    let relation = format!(
        "{}.{}",
        change.get("schema").and_then(Value::as_str).unwrap_or(""),
        change.get("table").and_then(Value::as_str).unwrap_or(""),
    );

    let mut metric_key = None;
    if let (Some(Value::Array(names)), Some(Value::Array(values))) =
        (change.get("columnnames"), change.get("columnvalues"))
    {
        metric_key = extract_key_from_pairs(names, values);
    }
    if metric_key.is_none() {
        if let Some(oldkeys) = change.get("oldkeys") {
            if let (Some(Value::Array(names)), Some(Value::Array(values))) =
                (oldkeys.get("keynames"), oldkeys.get("keyvalues"))
            {
                metric_key = extract_key_from_pairs(names, values);
            }
        }
    }

    Some(ChangeRecord {
        kind,
        relation,
        metric_key,
        lsn,
    })
}

fn decode_v2_action(object: &serde_json::Map<String, Value>, lsn: u64) -> Option<ChangeRecord> {
    let kind = ChangeKind::parse(object.get("action")?.as_str()?)?;
    let relation = format!(
        "{}.{}",
        object.get("schema").and_then(Value::as_str).unwrap_or(""),
        object.get("table").and_then(Value::as_str).unwrap_or(""),
    );

    let mut metric_key = None;
    if let Some(Value::Array(columns)) = object.get("columns") {
        metric_key = extract_key_from_columns(columns);
    }
    if metric_key.is_none() {
        if let Some(Value::Array(identity)) = object.get("identity") {
            metric_key = extract_key_from_columns(identity);
        }
    }

    Some(ChangeRecord {
        kind,
        relation,
        metric_key,
        lsn,
    })
}

fn extract_key_from_columns(columns: &[Value]) -> Option<i64> {
    columns.iter().find_map(|column| {
        (column.get("name")?.as_str()? == "metric_key")
            .then(|| column.get("value")?.as_i64())
            .flatten()
    })
}

fn extract_key_from_pairs(names: &[Value], values: &[Value]) -> Option<i64> {
    names
        .iter()
        .position(|name| name.as_str() == Some("metric_key"))
        .and_then(|index| values.get(index))
        .and_then(Value::as_i64)
}

/// Exponential backoff with full jitter for stream reconnection.
pub struct ExponentialBackoff {
    base: f64,
    multiplier: f64,
    max: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_seconds: f64, multiplier: f64, max_seconds: f64) -> Self {
        Self {
            base: base_seconds,
            multiplier,
            max: max_seconds,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Next delay in seconds: full jitter over the capped exponential curve.
    pub fn next_delay(&mut self) -> f64 {
        let raw = (self.base * self.multiplier.powi(self.attempt as i32)).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        rand::random::<f64>() * raw
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(0.5, 2.0, 30.0)
    }
}
