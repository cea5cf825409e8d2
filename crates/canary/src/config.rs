//! Historian egress configuration.

use serde::{Deserialize, Serialize};

/// Behaviour of the bounded queue feeding the egress client when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueuePolicy {
    /// Upstream flush blocks until there is room.
    Block,
    /// Overflow is recorded to the dead-letter store.
    Drop,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::Block
    }
}

/// Canary Write API client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Whether the egress pipeline runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Base URL of the historian's SAF endpoints
    #[serde(default)]
    pub base_url: String,
    /// API token exchanged for session tokens
    #[serde(default)]
    pub api_token: String,
    /// Client id reported on session acquisition
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Historians to bind the session to
    #[serde(default)]
    pub historians: Vec<String>,
    /// Write endpoint path; the documented spelling varies, so it is
    /// configuration rather than a constant
    #[serde(default = "default_endpoint_path")]
    pub endpoint_path: String,

    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub queue_policy: QueuePolicy,
    #[serde(default = "default_max_batch_tags")]
    pub max_batch_tags: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: f64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: f64,

    #[serde(default = "default_circuit_failures")]
    pub circuit_consecutive_failures: u32,
    #[serde(default = "default_circuit_reset")]
    pub circuit_reset_seconds: f64,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_keepalive_idle")]
    pub keepalive_idle_seconds: u64,
    #[serde(default = "default_keepalive_jitter")]
    pub keepalive_jitter_seconds: u64,

    /// Family prefix for dataset discovery (`<prefix>`, `<prefix>2`, …)
    #[serde(default)]
    pub dataset_prefix: String,
    /// Fixed dataset name for validation runs; bypasses discovery
    #[serde(default)]
    pub dataset_override: Option<String>,
    /// Dataset auto-creation; only honoured together with the override
    #[serde(default)]
    pub auto_create_datasets: bool,
}

fn default_true() -> bool {
    true
}

fn default_client_id() -> String {
    "uns-metadata-sync".to_string()
}

fn default_endpoint_path() -> String {
    "/storeData".to_string()
}

fn default_rate_limit_rps() -> u32 {
    500
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_max_batch_tags() -> usize {
    100
}

fn default_max_payload_bytes() -> usize {
    1_000_000
}

fn default_request_timeout() -> f64 {
    10.0
}

fn default_retry_attempts() -> u32 {
    6
}

fn default_retry_base_delay() -> f64 {
    0.2
}

fn default_retry_max_delay() -> f64 {
    6.4
}

fn default_circuit_failures() -> u32 {
    20
}

fn default_circuit_reset() -> f64 {
    60.0
}

fn default_session_timeout_ms() -> u64 {
    120_000
}

fn default_keepalive_idle() -> u64 {
    30
}

fn default_keepalive_jitter() -> u64 {
    10
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: String::new(),
            api_token: String::new(),
            client_id: default_client_id(),
            historians: Vec::new(),
            endpoint_path: default_endpoint_path(),
            rate_limit_rps: default_rate_limit_rps(),
            queue_capacity: default_queue_capacity(),
            queue_policy: QueuePolicy::default(),
            max_batch_tags: default_max_batch_tags(),
            max_payload_bytes: default_max_payload_bytes(),
            request_timeout_seconds: default_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            circuit_consecutive_failures: default_circuit_failures(),
            circuit_reset_seconds: default_circuit_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            keepalive_idle_seconds: default_keepalive_idle(),
            keepalive_jitter_seconds: default_keepalive_jitter(),
            dataset_prefix: String::new(),
            dataset_override: None,
            auto_create_datasets: false,
        }
    }
}

impl CanaryConfig {
    /// Absolute write endpoint URL.
    pub fn write_endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.endpoint_path.trim();
        if path.is_empty() {
            return base.to_string();
        }
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_endpoint_normalises_slashes() {
        let mut config = CanaryConfig {
            base_url: "https://historian.example/api/v1/".into(),
            ..CanaryConfig::default()
        };
        assert_eq!(
            config.write_endpoint(),
            "https://historian.example/api/v1/storeData"
        );
        config.endpoint_path = "storeData2".into();
        assert_eq!(
            config.write_endpoint(),
            "https://historian.example/api/v1/storeData2"
        );
    }
}
