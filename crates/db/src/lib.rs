//! Metadata store: planner, repository, dead-letter store, migrations.

mod bulk;
pub mod client;
pub mod config;
pub mod dlq;
pub mod ingest;
pub mod migrations;
pub mod model;
pub mod planner;
pub mod repository;
pub mod sink;

pub use client::connect;
pub use config::{DbConfig, DbMode};
pub use dlq::{DeadLetterStore, DlqRow};
pub use ingest::{FrameIngestor, IngestReport};
pub use migrations::{Migration, MigrationRunner, MigrationSummary, MIGRATIONS};
pub use model::{
    BulkOutcome, DeviceInput, DeviceNaturalKey, DeviceRow, MetricInput, MetricRow,
    MetricSnapshot, Outcome, PropertyRow,
};
pub use planner::{
    plan_device, plan_metric, DeviceAction, DevicePlan, FramePlan, MetricAction, MetricPlan,
    PropertyOp,
};
pub use repository::MetadataRepository;
pub use sink::JsonlSink;
