//! HTTP surface for health and metrics probes.

pub mod routes;

pub use routes::router;
