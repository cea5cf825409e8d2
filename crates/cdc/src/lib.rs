//! Change-data-capture: logical replication intake, debounce aggregation,
//! checkpointed emission.

pub mod checkpoint;
pub mod config;
pub mod debounce;
pub mod diffing;
pub mod listener;
pub mod replication;

pub use checkpoint::{
    format_lsn, parse_lsn, CheckpointGate, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore,
};
pub use config::{CdcConfig, CheckpointBackend};
pub use debounce::{AggregatedDiff, DebounceBuffer};
pub use diffing::{flatten_version_diff, ChangeValue, DiffEvent};
pub use listener::{
    CdcListener, DiffSink, ListenerState, MetadataProvider, MetricIdentity, PgMetadataProvider,
    VersionRecord,
};
pub use replication::{
    decode_message, ChangeKind, ChangeRecord, ChangeStream, ExponentialBackoff, SqlChangeStream,
    StreamMessage,
};
