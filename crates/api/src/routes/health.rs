//! Liveness and readiness endpoints.

use axum::{http::StatusCode, Json};
use telemetry::{health, metrics, HealthReport};

/// GET /healthz — process liveness.
pub async fn healthz() -> StatusCode {
    if health().is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /readyz — readiness with the component report.
///
/// Degraded (503) when the egress circuit is open, the CDC stream is
/// reconnecting, or the store is unreachable.
pub async fn readyz() -> (StatusCode, Json<HealthReport>) {
    let report = health().report();
    let status = if health().is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /metrics — numeric snapshot of the pipeline counters.
pub async fn metrics_snapshot() -> Json<telemetry::MetricsSnapshot> {
    Json(metrics().snapshot())
}
