//! Frame ingest worker: decoded birth frame → normalized inputs → planned
//! writes.
//!
//! Consumes decoded frames from the intake channel, derives canonical device
//! and metric identities, and persists through either the per-row planner
//! path or the staged bulk path. Data frames and alias placeholders flow
//! through the channel but are never persisted.

use std::collections::BTreeMap;

use sync_core::{
    classify_property, normalize_device_path, normalize_metric_path, DecodedFrame, DecodedMetric,
    MessageType, MetricValue, Result,
};
use telemetry::metrics;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DbMode;
use crate::model::{BulkOutcome, DeviceInput, MetricInput, Outcome};
use crate::planner::{plan_device, plan_metric, FramePlan};
use crate::repository::MetadataRepository;
use crate::sink::JsonlSink;

/// What a frame ingest produced.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestReport {
    /// Frame carried nothing persistable (data frame, missing dimensions,
    /// placeholder-only metrics).
    Skipped(&'static str),
    /// Per-row planner path.
    Applied(Outcome),
    /// Staged bulk path.
    AppliedBulk(BulkOutcome),
    /// Mock mode: journalled to the local sink only.
    Journalled,
}

/// Ingest pipeline stage between the intake channel and the store.
pub struct FrameIngestor {
    mode: DbMode,
    repository: Option<MetadataRepository>,
    sink: Option<JsonlSink>,
    bulk_threshold: usize,
}

impl FrameIngestor {
    pub fn new(
        mode: DbMode,
        repository: Option<MetadataRepository>,
        sink: Option<JsonlSink>,
        bulk_threshold: usize,
    ) -> Self {
        Self {
            mode,
            repository,
            sink,
            bulk_threshold,
        }
    }

    /// Drain the intake channel until it closes or shutdown is requested.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<DecodedFrame>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(mode = ?self.mode, bulk_threshold = self.bulk_threshold, "frame ingestor starting");
        enum Next {
            Frame(DecodedFrame),
            Closed,
            Cancelled,
        }

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Next::Cancelled,
                frame = rx.recv() => match frame {
                    Some(frame) => Next::Frame(frame),
                    None => Next::Closed,
                }
            };

            match next {
                Next::Frame(frame) => self.ingest_logged(&frame).await,
                Next::Closed => break,
                Next::Cancelled => {
                    // Drain whatever intake already queued before exiting.
                    while let Ok(frame) = rx.try_recv() {
                        self.ingest_logged(&frame).await;
                    }
                    break;
                }
            }
        }
        info!("frame ingestor stopped");
        Ok(())
    }

    async fn ingest_logged(&self, frame: &DecodedFrame) {
        match self.ingest(frame).await {
            Ok(report) => {
                debug!(?report, group = %frame.group, edge = %frame.edge, "frame ingested")
            }
            Err(err) => warn!(
                group = %frame.group,
                edge = %frame.edge,
                error = %err,
                "frame persistence failed"
            ),
        }
    }

    /// Persist one frame. Exposed for the fixture-ingest operator command
    /// and tests.
    pub async fn ingest(&self, frame: &DecodedFrame) -> Result<IngestReport> {
        self.journal(frame)?;

        if frame.message_type != MessageType::Dbirth {
            return Ok(IngestReport::Skipped("not a device birth"));
        }
        let Some(device) = frame.device.as_deref() else {
            return Ok(IngestReport::Skipped("missing device segment"));
        };
        let repository = match (&self.mode, &self.repository) {
            (DbMode::Mock, _) | (_, None) => return Ok(IngestReport::Journalled),
            (DbMode::Local, Some(repository)) => repository,
        };

        let Some(device_input) = self.device_input(frame, device)? else {
            metrics().frames_skipped.inc();
            return Ok(IngestReport::Skipped("missing classification dimensions"));
        };
        let metric_inputs = self.metric_inputs(frame, device)?;
        if metric_inputs.is_empty() {
            return Ok(IngestReport::Skipped("no persistable metrics"));
        }

        let existing_device = repository
            .snapshot_device(&device_input.uns_path, &device_input.natural_key())
            .await?;
        let device_is_new = existing_device.is_none();
        let device_plan = plan_device(device_input, existing_device.as_ref());

        if use_bulk_path(self.bulk_threshold, metric_inputs.len(), device_is_new) {
            let outcome = repository.apply_bulk(&device_plan, &metric_inputs).await?;
            return Ok(IngestReport::AppliedBulk(outcome));
        }

        let mut metric_plans = Vec::with_capacity(metric_inputs.len());
        for input in metric_inputs {
            let snapshot = match device_plan.device_key {
                Some(device_key) => {
                    repository
                        .snapshot_metric(device_key, &input.name, &input.uns_path)
                        .await?
                }
                None => None,
            };
            metric_plans.push(plan_metric(input, snapshot.as_ref()));
        }

        let plan = FramePlan {
            device: device_plan,
            metrics: metric_plans,
        };
        let outcome = repository.apply_plan(&plan).await?;
        Ok(IngestReport::Applied(outcome))
    }

    fn journal(&self, frame: &DecodedFrame) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let topic = format!(
            "spBv1.0/{}/{}/{}{}",
            frame.group,
            match frame.message_type {
                MessageType::Dbirth => "DBIRTH",
                MessageType::Nbirth => "NBIRTH",
                _ => "DATA",
            },
            frame.edge,
            frame
                .device
                .as_deref()
                .map(|d| format!("/{d}"))
                .unwrap_or_default()
        );
        sink.append(&topic, &serde_json::to_value(frame)?)
    }

    /// Derive the device identity; `None` when a required classification
    /// dimension is missing from the frame.
    fn device_input(&self, frame: &DecodedFrame, device: &str) -> Result<Option<DeviceInput>> {
        let uns_path = normalize_device_path(&frame.group, &frame.edge, Some(device))?;

        let mut dims = BTreeMap::new();
        for dimension in ["country", "business_unit", "plant"] {
            match extract_dimension(&frame.metrics, dimension) {
                Some(value) => {
                    dims.insert(dimension, value);
                }
                None => {
                    warn!(
                        dimension = dimension,
                        uns_path = %uns_path,
                        "missing required classification dimension; skipping persistence"
                    );
                    return Ok(None);
                }
            }
        }

        Ok(Some(DeviceInput {
            group_id: frame.group.clone(),
            country: dims["country"].clone(),
            business_unit: dims["business_unit"].clone(),
            plant: dims["plant"].clone(),
            edge: frame.edge.clone(),
            device: device.to_string(),
            uns_path,
        }))
    }

    /// Normalize the frame's metrics into persistable inputs.
    ///
    /// Alias placeholders (no resolved name) and metrics without a valid
    /// datatype are skipped with a log line; properties are re-typed through
    /// the classification rules.
    fn metric_inputs(&self, frame: &DecodedFrame, device: &str) -> Result<Vec<MetricInput>> {
        let mut inputs = Vec::with_capacity(frame.metrics.len());
        for metric in &frame.metrics {
            let Some(name) = metric.name.as_deref().filter(|n| !n.is_empty()) else {
                debug!(identity = %metric.identity(), "skipping unresolved metric");
                continue;
            };
            let Some(datatype) = metric.datatype.clone() else {
                warn!(metric = %name, "missing or invalid datatype; skipping metric");
                continue;
            };
            let uns_path =
                match normalize_metric_path(&frame.group, &frame.edge, Some(device), name) {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(metric = %name, error = %err, "metric path normalization failed");
                        continue;
                    }
                };

            let mut properties = BTreeMap::new();
            for (key, value) in &metric.properties {
                if let Some(classified) = classify_property(value) {
                    properties.insert(key.clone(), classified);
                }
            }

            inputs.push(MetricInput {
                name: name.to_string(),
                uns_path,
                datatype,
                properties,
            });
        }
        Ok(inputs)
    }
}

/// Whether a frame takes the staged bulk path.
///
/// Bulk serves only the first birth of a large device: with no prior rows
/// every staged write is an insert and its version row is written alongside.
/// A re-birth of an existing device always goes through the planner, whose
/// plans couple property changes to their version and lineage writes.
fn use_bulk_path(bulk_threshold: usize, metric_count: usize, device_is_new: bool) -> bool {
    device_is_new && metric_count >= bulk_threshold
}

/// Find a classification dimension metric (`country`, `business_unit`,
/// `plant`) by case-insensitive name and return its trimmed string value.
fn extract_dimension(metrics: &[DecodedMetric], key: &str) -> Option<String> {
    for metric in metrics {
        let name = metric.name.as_deref()?;
        if !name.eq_ignore_ascii_case(key) {
            continue;
        }
        return match &metric.value {
            Some(MetricValue::String(value)) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Some(MetricValue::Int(v)) => Some(v.to_string()),
            Some(MetricValue::UInt(v)) => Some(v.to_string()),
            _ => None,
        };
    }
    None
}
