//! Canary historian egress: session lifecycle, payload mapping, dataset
//! resolution, rate-limited and circuit-broken delivery.

pub mod client;
pub mod config;
pub mod dataset;
pub mod payload;
pub mod session;

pub use client::{
    BatchSender, BreakerState, CircuitBreaker, DeadLetterSink, Delivery, EgressClient,
    EgressQueue, HttpBatchSender, OnSettled, RetryPolicy, SessionProvider, TokenBucket,
};
pub use config::{CanaryConfig, QueuePolicy};
pub use dataset::{BrowsePage, DatasetResolver, HttpNamespaceBrowser, NamespaceBrowser};
pub use payload::{PayloadMapper, WriteBatch, QUALITY_GOOD};
pub use session::{SessionManager, SessionState};
