//! Route table.

pub mod health;

use axum::{routing::get, Router};

/// Build the service router.
pub fn router() -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics_snapshot))
}
