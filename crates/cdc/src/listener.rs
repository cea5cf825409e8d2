//! CDC listener service.
//!
//! Consumes the logical-replication stream for the metadata publication,
//! resolves each change to its metric identity and latest version diff,
//! merges changes through the debounce buffer, and emits aggregated diffs
//! downstream. The resume token is advanced only once a change's diff has
//! settled (delivered or dead-lettered) — never past unflushed work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sync_core::{Error, Result};
use telemetry::{health, metrics};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{format_lsn, CheckpointGate, CheckpointStore};
use crate::config::CdcConfig;
use crate::debounce::{AggregatedDiff, DebounceBuffer};
use crate::diffing::{flatten_version_diff, DiffEvent};
use crate::replication::{decode_message, ChangeStream, ExponentialBackoff};

/// Dedup-set bound; beyond this the set is cleared and the idempotent store
/// downstream absorbs any re-emission.
const SEEN_EVENTS_CAP: usize = 100_000;

/// Connection lifecycle of the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Shutdown,
}

/// Identity columns for a metric under change.
#[derive(Debug, Clone)]
pub struct MetricIdentity {
    pub metric_key: i64,
    pub uns_path: String,
    pub canary_id: String,
}

/// Latest version row for a metric.
#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub version: i64,
    pub actor: String,
    pub changed_at: DateTime<Utc>,
    pub diff: serde_json::Value,
}

/// Resolves metric metadata used to build diff events.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn identity(&self, metric_key: i64) -> Result<Option<MetricIdentity>>;
    async fn latest_version(&self, metric_key: i64) -> Result<Option<VersionRecord>>;
}

/// Metadata provider backed by the metadata schema.
pub struct PgMetadataProvider {
    pool: PgPool,
    schema: String,
}

impl PgMetadataProvider {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

#[async_trait]
impl MetadataProvider for PgMetadataProvider {
    async fn identity(&self, metric_key: i64) -> Result<Option<MetricIdentity>> {
        let row: Option<(i64, String, String)> = sqlx::query_as(&format!(
            "SELECT metric_key, uns_path, canary_id FROM {}.metrics WHERE metric_key = $1",
            self.schema
        ))
        .bind(metric_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| Error::transient(format!("identity lookup failed: {err}")))?;
        Ok(row.map(|(metric_key, uns_path, canary_id)| MetricIdentity {
            metric_key,
            uns_path,
            canary_id,
        }))
    }

    async fn latest_version(&self, metric_key: i64) -> Result<Option<VersionRecord>> {
        let row: Option<(i64, String, DateTime<Utc>, serde_json::Value)> =
            sqlx::query_as(&format!(
                "SELECT version_id, changed_by, changed_at, diff FROM {}.metric_versions \
                 WHERE metric_key = $1 ORDER BY version_id DESC LIMIT 1",
                self.schema
            ))
            .bind(metric_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| Error::transient(format!("version lookup failed: {err}")))?;
        Ok(row.map(|(version, actor, changed_at, diff)| VersionRecord {
            version,
            actor,
            changed_at,
            diff,
        }))
    }
}

/// Downstream consumer of aggregated diffs (the egress queue).
#[async_trait]
pub trait DiffSink: Send + Sync {
    /// Hand off one diff. Implementations own the backpressure policy; an
    /// error means the diff could not be accepted and its position must not
    /// block the checkpoint.
    async fn emit(&self, diff: AggregatedDiff) -> Result<()>;
}

/// The CDC listener task.
pub struct CdcListener<S: ChangeStream> {
    stream: S,
    provider: Arc<dyn MetadataProvider>,
    sink: Arc<dyn DiffSink>,
    checkpoint: Arc<dyn CheckpointStore>,
    gate: Arc<CheckpointGate>,
    config: CdcConfig,
    slot_name: String,
    state: ListenerState,
    buffer: DebounceBuffer,
    seen_events: HashSet<String>,
    backoff: ExponentialBackoff,
    stream_position: u64,
    last_saved: u64,
    processed_since_checkpoint: i64,
}

impl<S: ChangeStream> CdcListener<S> {
    pub fn new(
        stream: S,
        provider: Arc<dyn MetadataProvider>,
        sink: Arc<dyn DiffSink>,
        checkpoint: Arc<dyn CheckpointStore>,
        gate: Arc<CheckpointGate>,
        config: CdcConfig,
        slot_name: impl Into<String>,
    ) -> Self {
        let buffer = DebounceBuffer::new(
            Duration::from_secs(config.window_seconds),
            config.buffer_cap,
        );
        Self {
            stream,
            provider,
            sink,
            checkpoint,
            gate,
            config,
            slot_name: slot_name.into(),
            state: ListenerState::Disconnected,
            buffer,
            seen_events: HashSet::new(),
            backoff: ExponentialBackoff::default(),
            stream_position: 0,
            last_saved: 0,
            processed_since_checkpoint: 0,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Run until cancelled: fetch → decode → debounce → flush → checkpoint.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.state = ListenerState::Connecting;
        if let Some(token) = self.checkpoint.load(&self.slot_name) {
            self.stream_position = token;
            self.last_saved = token;
            info!(slot = %self.slot_name, lsn = %format_lsn(token), "resuming from persisted token");
        }

        let flush_interval = Duration::from_secs_f64(self.config.flush_interval_seconds);
        let mut last_flush = Instant::now();

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.stream.fetch(self.config.max_batch_messages) => Some(result),
            };
            let Some(result) = fetched else {
                self.shutdown().await;
                return Ok(());
            };

            match result {
                Ok(messages) => {
                    if self.state != ListenerState::Streaming {
                        self.state = ListenerState::Streaming;
                        health().cdc.set_healthy();
                        self.backoff.reset();
                    }
                    let processed = self.process_messages(messages).await;

                    if last_flush.elapsed() >= flush_interval {
                        self.flush_ready(Instant::now()).await;
                        last_flush = Instant::now();
                        self.maybe_checkpoint(true).await;
                    } else {
                        self.maybe_checkpoint(false).await;
                    }

                    if processed == 0
                        && self
                            .wait_or_cancel(
                                Duration::from_secs_f64(self.config.idle_sleep_seconds),
                                &cancel,
                            )
                            .await
                    {
                        self.shutdown().await;
                        return Ok(());
                    }
                }
                Err(err) => {
                    self.state = ListenerState::Reconnecting;
                    health().cdc.set_unhealthy(err.to_string());
                    metrics().cdc_errors.inc();
                    metrics().cdc_reconnects.inc();
                    let delay = self.backoff.next_delay();
                    warn!(error = %err, delay_s = delay, "replication stream error; backing off");
                    if self
                        .wait_or_cancel(Duration::from_secs_f64(delay), &cancel)
                        .await
                    {
                        self.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep for `duration`; returns true when cancellation arrived first.
    async fn wait_or_cancel(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn process_messages(&mut self, messages: Vec<crate::replication::StreamMessage>) -> usize {
        let mut processed = 0;
        for message in messages {
            // Replay guard: peeked messages at or below the confirmed token
            // were already settled in a previous run.
            if message.lsn <= self.last_saved {
                continue;
            }
            match decode_message(&message) {
                Ok(records) => {
                    for record in records {
                        processed += 1;
                        metrics().cdc_records.inc();
                        if let Some(metric_key) = record.metric_key {
                            if let Err(err) = self.handle_change(metric_key, record.lsn).await {
                                metrics().cdc_errors.inc();
                                warn!(metric_key, error = %err, "change handling failed");
                            }
                        }
                    }
                }
                Err(err) => {
                    metrics().cdc_errors.inc();
                    warn!(lsn = %format_lsn(message.lsn), error = %err, "dropping undecodable replication message");
                }
            }
            self.stream_position = self.stream_position.max(message.lsn);
            self.processed_since_checkpoint += 1;
        }
        processed
    }

    /// Resolve the change to identity + latest version diff and merge it
    /// into the buffer. Duplicate `(metric, version)` events are dropped.
    async fn handle_change(&mut self, metric_key: i64, lsn: u64) -> Result<()> {
        let Some(identity) = self.provider.identity(metric_key).await? else {
            debug!(metric_key, "metric missing from metadata store");
            return Ok(());
        };
        let Some(version) = self.provider.latest_version(metric_key).await? else {
            return Ok(());
        };
        let changes = flatten_version_diff(&version.diff);
        if changes.is_empty() {
            return Ok(());
        }

        let event_id = format!("{metric_key}:{}", version.version);
        if self.seen_events.len() >= SEEN_EVENTS_CAP {
            self.seen_events.clear();
        }
        if !self.seen_events.insert(event_id.clone()) {
            return Ok(());
        }

        let event = DiffEvent {
            event_id,
            metric_key,
            uns_path: identity.uns_path,
            canary_id: identity.canary_id,
            version: version.version,
            actor: version.actor,
            changes,
            changed_at: version.changed_at,
            lsn,
        };
        if self.buffer.add(&event, Instant::now()) {
            metrics().cdc_events.inc();
        }
        Ok(())
    }

    async fn flush_ready(&mut self, now: Instant) {
        let ready = self.buffer.flush_expired(now);
        self.emit(ready).await;
    }

    async fn emit(&mut self, diffs: Vec<AggregatedDiff>) {
        for diff in diffs {
            let lsn = diff.max_lsn;
            self.gate.track(lsn);
            match self.sink.emit(diff).await {
                Ok(()) => {
                    metrics().cdc_payloads.inc();
                }
                Err(err) => {
                    // The sink refused the diff (queue closed or drop
                    // policy); release its position so the checkpoint is
                    // not wedged forever.
                    self.gate.confirm(lsn);
                    metrics().cdc_errors.inc();
                    warn!(error = %err, "diff sink rejected aggregated diff");
                }
            }
        }
    }

    /// Persist the resume token when the cadence is due, never past work
    /// that has not settled downstream.
    async fn maybe_checkpoint(&mut self, force: bool) {
        let interval = (self.config.max_batch_messages / 2).max(1);
        if !force && self.processed_since_checkpoint < interval {
            return;
        }
        self.processed_since_checkpoint = 0;

        let safe = self
            .gate
            .safe_position(self.stream_position, self.buffer.min_buffered_lsn());
        if safe <= self.last_saved {
            return;
        }
        if let Err(err) = self.checkpoint.save(&self.slot_name, safe) {
            warn!(error = %err, "resume token persistence failed");
            return;
        }
        if let Err(err) = self.stream.advance(safe).await {
            warn!(error = %err, "slot advance failed; will retry next checkpoint");
            return;
        }
        self.last_saved = safe;
        debug!(lsn = %format_lsn(safe), "checkpoint advanced");
    }

    async fn shutdown(&mut self) {
        info!("cdc listener shutting down; draining debounce buffer");
        self.state = ListenerState::Shutdown;
        let residue = self.buffer.drain();
        self.emit(residue).await;
        // Final token write; the store fsyncs when configured to.
        self.maybe_checkpoint(true).await;
        health().cdc.set_unhealthy("shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::replication::StreamMessage;
    use parking_lot::Mutex;

    struct ScriptedStream {
        batches: Mutex<Vec<Vec<StreamMessage>>>,
        advanced: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ChangeStream for ScriptedStream {
        async fn fetch(&self, _max: i64) -> Result<Vec<StreamMessage>> {
            let mut batches = self.batches.lock();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }

        async fn advance(&self, lsn: u64) -> Result<()> {
            self.advanced.lock().push(lsn);
            Ok(())
        }
    }

    struct StaticProvider;

    #[async_trait]
    impl MetadataProvider for StaticProvider {
        async fn identity(&self, metric_key: i64) -> Result<Option<MetricIdentity>> {
            Ok(Some(MetricIdentity {
                metric_key,
                uns_path: "Secil/EdgeA/DeviceA/Temperature/PV".into(),
                canary_id: "Secil.EdgeA.DeviceA.Temperature.PV".into(),
            }))
        }

        async fn latest_version(&self, _metric_key: i64) -> Result<Option<VersionRecord>> {
            Ok(Some(VersionRecord {
                version: 1,
                actor: "uns-metadata-sync".into(),
                changed_at: Utc::now(),
                diff: serde_json::json!({
                    "properties": {"displayHigh": {"type": "int", "old": 1800, "new": 2000}}
                }),
            }))
        }
    }

    struct CollectingSink {
        emitted: Mutex<Vec<AggregatedDiff>>,
    }

    #[async_trait]
    impl DiffSink for CollectingSink {
        async fn emit(&self, diff: AggregatedDiff) -> Result<()> {
            self.emitted.lock().push(diff);
            Ok(())
        }
    }

    fn update_message(lsn: u64, metric_key: i64) -> StreamMessage {
        StreamMessage {
            lsn,
            data: serde_json::json!({
                "action": "U",
                "schema": "uns_meta",
                "table": "metric_properties",
                "columns": [{"name": "metric_key", "type": "bigint", "value": metric_key}]
            })
            .to_string(),
        }
    }

    fn listener(
        batches: Vec<Vec<StreamMessage>>,
        sink: Arc<CollectingSink>,
        window_seconds: u64,
    ) -> CdcListener<ScriptedStream> {
        let stream = ScriptedStream {
            batches: Mutex::new(batches),
            advanced: Mutex::new(Vec::new()),
        };
        let config = CdcConfig {
            window_seconds,
            ..CdcConfig::default()
        };
        CdcListener::new(
            stream,
            Arc::new(StaticProvider),
            sink,
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(CheckpointGate::new()),
            config,
            "uns_meta_slot",
        )
    }

    #[tokio::test]
    async fn change_flows_into_debounce_buffer_once() {
        let sink = Arc::new(CollectingSink {
            emitted: Mutex::new(Vec::new()),
        });
        let mut listener = listener(Vec::new(), sink.clone(), 180);

        let processed = listener
            .process_messages(vec![update_message(100, 7), update_message(101, 7)])
            .await;
        assert_eq!(processed, 2);
        // Same (metric, version) pair deduplicates to one buffered entry.
        assert_eq!(listener.buffer.depth(), 1);
        assert_eq!(listener.stream_position, 101);
    }

    #[tokio::test]
    async fn checkpoint_waits_for_buffered_work() {
        let sink = Arc::new(CollectingSink {
            emitted: Mutex::new(Vec::new()),
        });
        let mut listener = listener(Vec::new(), sink.clone(), 180);

        listener
            .process_messages(vec![update_message(100, 7)])
            .await;
        listener.maybe_checkpoint(true).await;
        // The buffered change at lsn 100 pins the token below it.
        assert_eq!(listener.checkpoint.load("uns_meta_slot"), Some(99));

        // Drain and settle; now the stream position is safe.
        let residue = listener.buffer.drain();
        listener.emit(residue).await;
        listener.gate.confirm(100);
        listener.maybe_checkpoint(true).await;
        assert_eq!(listener.checkpoint.load("uns_meta_slot"), Some(100));
        assert_eq!(sink.emitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn drain_on_shutdown_emits_residue() {
        let sink = Arc::new(CollectingSink {
            emitted: Mutex::new(Vec::new()),
        });
        let mut listener = listener(Vec::new(), sink.clone(), 600);
        listener
            .process_messages(vec![update_message(50, 3)])
            .await;

        listener.shutdown().await;
        assert_eq!(listener.state(), ListenerState::Shutdown);
        assert_eq!(sink.emitted.lock().len(), 1);
        assert_eq!(sink.emitted.lock()[0].canary_id, "Secil.EdgeA.DeviceA.Temperature.PV");
    }
}
