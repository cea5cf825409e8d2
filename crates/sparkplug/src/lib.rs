//! Sparkplug B intake: payload decoding, alias resolution, MQTT subscription.

pub mod alias;
pub mod config;
pub mod decode;
pub mod proto;
pub mod subscriber;

pub use alias::{AliasCache, AliasEntry, AliasResolution, RebirthThrottle};
pub use config::BrokerConfig;
pub use decode::{decode_frame, decode_payload, SparkplugTopic};
pub use subscriber::Subscriber;
