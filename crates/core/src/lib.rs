//! Core types, path rules, and error taxonomy for the UNS metadata sync
//! pipeline.

pub mod error;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use paths::{normalize_device_path, normalize_metric_path, to_canary_id};
pub use types::*;
