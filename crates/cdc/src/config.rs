//! Debounce and checkpoint configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Resume-token persistence backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    File,
    Memory,
}

impl Default for CheckpointBackend {
    fn default() -> Self {
        Self::File
    }
}

/// CDC listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcConfig {
    /// Whether the listener runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Debounce window before a metric's merged diff is emitted
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Sweep cadence; kept well under a third of the window
    #[serde(default = "default_flush_interval")]
    pub flush_interval_seconds: f64,
    /// Maximum distinct metrics buffered at once
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap: usize,
    /// Sleep when the stream has nothing to deliver
    #[serde(default = "default_idle_sleep")]
    pub idle_sleep_seconds: f64,
    /// Messages read from the slot per fetch
    #[serde(default = "default_max_batch")]
    pub max_batch_messages: i64,
    #[serde(default)]
    pub checkpoint_backend: CheckpointBackend,
    /// Resume-token file for the `file` backend
    #[serde(default = "default_resume_path")]
    pub resume_path: PathBuf,
    /// fsync the resume-token file (and directory) on write
    #[serde(default)]
    pub resume_fsync: bool,
}

fn default_true() -> bool {
    true
}

fn default_window_seconds() -> u64 {
    180
}

fn default_flush_interval() -> f64 {
    5.0
}

fn default_buffer_cap() -> usize {
    1000
}

fn default_idle_sleep() -> f64 {
    1.0
}

fn default_max_batch() -> i64 {
    500
}

fn default_resume_path() -> PathBuf {
    PathBuf::from("cdc_resume_tokens.json")
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_seconds: default_window_seconds(),
            flush_interval_seconds: default_flush_interval(),
            buffer_cap: default_buffer_cap(),
            idle_sleep_seconds: default_idle_sleep(),
            max_batch_messages: default_max_batch(),
            checkpoint_backend: CheckpointBackend::default(),
            resume_path: default_resume_path(),
            resume_fsync: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_cadence_stays_under_a_third_of_the_window() {
        let config = CdcConfig::default();
        assert!(config.flush_interval_seconds * 3.0 < config.window_seconds as f64);
    }
}
