//! Telemetry: metrics registry, component health, tracing setup.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::{health, ComponentHealth, HealthReport, HealthRegistry, HealthStatus};
pub use metrics::{metrics, Counter, Gauge, Histogram, MetricsRegistry, MetricsSnapshot};
pub use tracing_setup::{init_tracing, init_tracing_from_env, TracingConfig};
