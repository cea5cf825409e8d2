//! Broker and intake configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// MQTT broker connection and Sparkplug intake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname
    #[serde(default)]
    pub host: String,
    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username for broker authentication
    #[serde(default)]
    pub user: String,
    /// Password for broker authentication
    #[serde(default)]
    pub password: String,
    /// MQTT client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Topic filter for device birth frames
    #[serde(default = "default_topic_filter")]
    pub topic_filter: String,
    /// Topic filter for node birth frames (alias population)
    #[serde(default = "default_nbirth_filter")]
    pub nbirth_topic_filter: String,
    /// CA certificate path enabling TLS to the broker
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
    /// File backing the persistent alias cache
    #[serde(default = "default_alias_cache_path")]
    pub alias_cache_path: PathBuf,
    /// Whether to publish rebirth requests for unresolvable aliases
    #[serde(default = "default_true")]
    pub auto_request_rebirth: bool,
    /// Cooldown between rebirth requests per (group, edge, device)
    #[serde(default = "default_rebirth_cooldown")]
    pub rebirth_cooldown_seconds: u64,
    /// Bound of the decode → ingest channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_port() -> u16 {
    8883
}

fn default_client_id() -> String {
    "uns-metadata-sync".to_string()
}

fn default_topic_filter() -> String {
    "spBv1.0/+/DBIRTH/#".to_string()
}

fn default_nbirth_filter() -> String {
    "spBv1.0/+/NBIRTH/#".to_string()
}

fn default_alias_cache_path() -> PathBuf {
    PathBuf::from("alias_cache.json")
}

fn default_true() -> bool {
    true
}

fn default_rebirth_cooldown() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            user: String::new(),
            password: String::new(),
            client_id: default_client_id(),
            topic_filter: default_topic_filter(),
            nbirth_topic_filter: default_nbirth_filter(),
            tls_ca: None,
            alias_cache_path: default_alias_cache_path(),
            auto_request_rebirth: default_true(),
            rebirth_cooldown_seconds: default_rebirth_cooldown(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_sparkplug_birth_filters() {
        let config = BrokerConfig::default();
        assert_eq!(config.topic_filter, "spBv1.0/+/DBIRTH/#");
        assert_eq!(config.nbirth_topic_filter, "spBv1.0/+/NBIRTH/#");
        assert!(config.auto_request_rebirth);
        assert_eq!(config.rebirth_cooldown_seconds, 60);
    }
}
