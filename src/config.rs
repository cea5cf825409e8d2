//! Application configuration.
//!
//! Layering: built-in defaults → optional `config/default.toml` →
//! environment variables with the `UNS` prefix and `__` separator
//! (e.g. `UNS__BROKER__HOST`). A `.env` file is loaded first when present.

use anyhow::{Context, Result};
use canary::CanaryConfig;
use cdc::CdcConfig;
use metadata_db::{DbConfig, DbMode};
use serde::{Deserialize, Serialize};
use sparkplug::BrokerConfig;

/// Dead-letter retention and operator tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Row TTL before a pending entry expires
    #[serde(default = "default_dlq_ttl")]
    pub ttl_seconds: i64,
    /// Pending depth that triggers the warning log and gauge
    #[serde(default = "default_dlq_alert_threshold")]
    pub alert_threshold: u64,
    /// Rows per replay chunk
    #[serde(default = "default_dlq_replay_batch")]
    pub replay_batch_size: i64,
}

fn default_dlq_ttl() -> i64 {
    7 * 24 * 3600
}

fn default_dlq_alert_threshold() -> u64 {
    100
}

fn default_dlq_replay_batch() -> i64 {
    100
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_dlq_ttl(),
            alert_threshold: default_dlq_alert_threshold(),
            replay_batch_size: default_dlq_replay_batch(),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Health listener bind host
    #[serde(default = "default_host")]
    pub host: String,
    /// Health listener bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Gates whether the repository writes or journals locally
    #[serde(default)]
    pub db_mode: DbMode,
    /// Journal decoded frames as JSON lines
    #[serde(default)]
    pub write_jsonl: bool,
    /// File pattern for the JSON-line journal
    #[serde(default = "default_jsonl_pattern")]
    pub jsonl_pattern: String,

    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub cdc: CdcConfig,
    #[serde(default)]
    pub egress: CanaryConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_jsonl_pattern() -> String {
    "messages_{topic}.jsonl".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_mode: DbMode::default(),
            write_jsonl: false,
            jsonl_pattern: default_jsonl_pattern(),
            broker: BrokerConfig::default(),
            db: DbConfig::default(),
            cdc: CdcConfig::default(),
            egress: CanaryConfig::default(),
            dlq: DlqConfig::default(),
        }
    }
}

/// Load configuration from files and environment.
pub fn load_config() -> Result<AppConfig> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&AppConfig::default())?)
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("UNS")
                .try_parsing(true),
        )
        .build()
        .context("failed to build configuration")?;

    config
        .try_deserialize()
        .context("failed to deserialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_cleanly() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cdc.window_seconds, 180);
        assert_eq!(config.egress.rate_limit_rps, 500);
        assert_eq!(config.dlq.ttl_seconds, 604_800);
        // Round trip through the config crate's value model.
        let built = config::Config::try_from(&config).unwrap();
        let back: AppConfig = built.try_deserialize().unwrap();
        assert_eq!(back.port, config.port);
    }
}
