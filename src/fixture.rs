//! Fixture frames for the `ingest-fixture` operator command.
//!
//! A fixture file is a JSON document holding one frame or an array of
//! frames:
//!
//! ```json
//! {
//!   "topic": "spBv1.0/Secil/DBIRTH/EdgeA/DeviceA",
//!   "metrics": [
//!     {"name": "country", "datatype": "String", "value": "PT"},
//!     {"name": "Temperature/PV", "datatype": "Float", "value": 812.5,
//!      "properties": {"engUnit": "°C", "displayHigh": 1800}}
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sparkplug::SparkplugTopic;
use sync_core::{DecodedFrame, DecodedMetric, MetricValue, PropertyValue};

#[derive(Debug, Deserialize)]
struct FixtureFrame {
    topic: String,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    metrics: Vec<FixtureMetric>,
}

#[derive(Debug, Deserialize)]
struct FixtureMetric {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    alias: Option<u64>,
    #[serde(default)]
    datatype: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    properties: BTreeMap<String, serde_json::Value>,
}

/// Load and decode all frames in a fixture file.
pub fn load_fixture(path: &Path) -> Result<Vec<DecodedFrame>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing fixture {}", path.display()))?;

    let frames: Vec<FixtureFrame> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };

    frames.into_iter().map(decode_fixture_frame).collect()
}

fn decode_fixture_frame(frame: FixtureFrame) -> Result<DecodedFrame> {
    let Some(topic) = SparkplugTopic::parse(&frame.topic) else {
        bail!("fixture topic '{}' is not a sparkplug topic", frame.topic);
    };

    let metrics = frame
        .metrics
        .into_iter()
        .map(|metric| DecodedMetric {
            name: metric.name,
            alias: metric.alias,
            datatype: metric.datatype,
            timestamp: None,
            value: metric.value.as_ref().and_then(json_to_metric_value),
            properties: metric
                .properties
                .iter()
                .filter_map(|(key, value)| {
                    json_to_property_value(value).map(|v| (key.clone(), v))
                })
                .collect(),
        })
        .collect();

    Ok(DecodedFrame {
        group: topic.group,
        message_type: topic.message_type,
        edge: topic.edge,
        device: topic.device,
        timestamp: frame.timestamp,
        metrics,
    })
}

fn json_to_metric_value(value: &serde_json::Value) -> Option<MetricValue> {
    match value {
        serde_json::Value::Bool(b) => Some(MetricValue::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(MetricValue::Int(i))
            } else {
                n.as_f64().map(MetricValue::Double)
            }
        }
        serde_json::Value::String(s) => Some(MetricValue::String(s.clone())),
        _ => None,
    }
}

fn json_to_property_value(value: &serde_json::Value) -> Option<PropertyValue> {
    match value {
        serde_json::Value::Bool(b) => Some(PropertyValue::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(PropertyValue::Long(i))
            } else {
                n.as_f64().map(PropertyValue::Double)
            }
        }
        serde_json::Value::String(s) => Some(PropertyValue::String(s.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::MessageType;

    #[test]
    fn fixture_round_trips_into_decoded_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("birth.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "topic": "spBv1.0/Secil/DBIRTH/EdgeA/DeviceA",
                "metrics": [
                    {"name": "country", "datatype": "String", "value": "PT"},
                    {"name": "Temperature/PV", "datatype": "Float", "value": 812.5,
                     "properties": {"engUnit": "°C", "displayHigh": 1800}}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let frames = load_fixture(&path).unwrap();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.message_type, MessageType::Dbirth);
        assert_eq!(frame.device.as_deref(), Some("DeviceA"));

        let temp = frame
            .metrics
            .iter()
            .find(|m| m.name.as_deref() == Some("Temperature/PV"))
            .unwrap();
        assert_eq!(
            temp.properties.get("displayHigh"),
            Some(&PropertyValue::Long(1800))
        );
        assert_eq!(
            temp.properties.get("engUnit"),
            Some(&PropertyValue::String("°C".into()))
        );
    }

    #[test]
    fn non_sparkplug_topic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            serde_json::json!({"topic": "not/a/sparkplug/topic", "metrics": []}).to_string(),
        )
        .unwrap();
        assert!(load_fixture(&path).is_err());
    }
}
