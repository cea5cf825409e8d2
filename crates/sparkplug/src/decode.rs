//! Sparkplug B topic parsing and payload decoding.
//!
//! Turns a raw MQTT publish (topic + binary payload) into a
//! [`DecodedFrame`](sync_core::DecodedFrame):
//! - parse the `spBv1.0/<Group>/<MessageType>/<Edge>[/<Device>]` topic
//! - decode the protobuf envelope, transparently unwrapping compression
//! - copy per-metric properties preserving the declared per-property types

use std::collections::BTreeMap;
use std::io::Read;

use prost::Message;
use sync_core::{
    datatype_name, DatasetValue, DecodedFrame, DecodedMetric, Error, MessageType, MetricValue,
    PropertyValue, Result,
};
use telemetry::metrics;
use tracing::warn;

use crate::proto;

/// Sparkplug namespace expected as the first topic segment.
const NAMESPACE: &str = "spbv1.0";

/// Marker uuid carried by compression wrapper payloads.
const COMPRESSED_UUID: &str = "SPBV1.0_COMPRESSED";

/// Parsed Sparkplug topic identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparkplugTopic {
    pub group: String,
    pub message_type: MessageType,
    pub edge: String,
    pub device: Option<String>,
}

impl SparkplugTopic {
    /// Parse `spBv1.0/<Group>/<MessageType>/<Edge>[/<Device>]`.
    ///
    /// Returns `None` for topics outside the Sparkplug namespace so callers
    /// can drop them without treating it as an error.
    pub fn parse(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 4 || !parts[0].eq_ignore_ascii_case(NAMESPACE) {
            return None;
        }
        Some(Self {
            group: parts[1].to_string(),
            message_type: MessageType::from_segment(parts[2]),
            edge: parts[3].to_string(),
            device: parts.get(4).map(|segment| segment.to_string()),
        })
    }
}

/// Parse a payload and transparently unwrap any compression wrapper.
pub fn decode_payload(blob: &[u8]) -> Result<proto::Payload> {
    let outer = proto::Payload::decode(blob)
        .map_err(|err| Error::malformed(format!("protobuf decode failed: {err}")))?;
    unwrap_if_compressed(outer)
}

/// Whether `payload` wraps a compressed Sparkplug message.
fn is_compressed_wrapper(payload: &proto::Payload) -> bool {
    let has_body = payload.body.as_ref().is_some_and(|body| !body.is_empty());
    if !has_body {
        return false;
    }
    if payload.uuid.as_deref() == Some(COMPRESSED_UUID) {
        return true;
    }
    payload.metrics.iter().any(|metric| {
        metric.name.as_deref() == Some("algorithm")
            && matches!(
                &metric.value,
                Some(proto::metric::Value::StringValue(algo)) if algo == "GZIP"
            )
    })
}

/// Inflate nested payloads that use Sparkplug compression wrappers.
fn unwrap_if_compressed(payload: proto::Payload) -> Result<proto::Payload> {
    if !is_compressed_wrapper(&payload) {
        return Ok(payload);
    }
    let body = payload
        .body
        .ok_or_else(|| Error::malformed("compressed payload had empty body"))?;

    let mut inflated = Vec::new();
    let mut gz = flate2::read::GzDecoder::new(body.as_slice());
    if gz.read_to_end(&mut inflated).is_err() {
        inflated.clear();
        let mut zlib = flate2::read::ZlibDecoder::new(body.as_slice());
        zlib.read_to_end(&mut inflated)
            .map_err(|err| Error::malformed(format!("payload decompression failed: {err}")))?;
    }

    proto::Payload::decode(inflated.as_slice())
        .map_err(|err| Error::malformed(format!("inner protobuf decode failed: {err}")))
}

/// Decode a full frame: topic identity plus structured metrics.
pub fn decode_frame(topic: &SparkplugTopic, blob: &[u8]) -> Result<DecodedFrame> {
    let payload = decode_payload(blob)?;
    let metrics_out = payload
        .metrics
        .iter()
        .map(|metric| decode_metric(topic, metric))
        .collect();

    Ok(DecodedFrame {
        group: topic.group.clone(),
        message_type: topic.message_type,
        edge: topic.edge.clone(),
        device: topic.device.clone(),
        timestamp: payload.timestamp,
        metrics: metrics_out,
    })
}

fn decode_metric(topic: &SparkplugTopic, metric: &proto::Metric) -> DecodedMetric {
    let name = metric.name.clone().filter(|name| !name.is_empty());
    let context = name
        .clone()
        .or_else(|| metric.alias.map(|alias| format!("alias:{alias}")))
        .unwrap_or_else(|| "<unnamed>".to_string());

    DecodedMetric {
        name,
        alias: metric.alias.filter(|alias| *alias > 0),
        datatype: metric
            .datatype
            .and_then(datatype_name)
            .map(|name| name.to_string()),
        timestamp: metric.timestamp,
        value: metric.value.as_ref().map(decode_metric_value),
        properties: decode_properties(topic, &context, metric.properties.as_ref()),
    }
}

fn decode_metric_value(value: &proto::metric::Value) -> MetricValue {
    use proto::metric::Value;
    match value {
        Value::IntValue(v) => MetricValue::Int(*v as i32 as i64),
        Value::LongValue(v) => MetricValue::UInt(*v),
        Value::FloatValue(v) => MetricValue::Float(*v),
        Value::DoubleValue(v) => MetricValue::Double(*v),
        Value::BooleanValue(v) => MetricValue::Bool(*v),
        Value::StringValue(v) => MetricValue::String(v.clone()),
        Value::BytesValue(v) => MetricValue::Bytes(v.clone()),
        Value::DatasetValue(dataset) => MetricValue::Dataset(flatten_dataset(dataset)),
    }
}

/// Flatten a dataset value to the stable `{columns, rows}` shape.
fn flatten_dataset(dataset: &proto::DataSet) -> DatasetValue {
    let rows = dataset
        .rows
        .iter()
        .map(|row| {
            row.elements
                .iter()
                .map(|element| match &element.value {
                    Some(value) => dataset_element_json(value),
                    None => serde_json::Value::Null,
                })
                .collect()
        })
        .collect();
    DatasetValue {
        columns: dataset.columns.clone(),
        rows,
    }
}

fn dataset_element_json(value: &proto::data_set::data_set_value::Value) -> serde_json::Value {
    use proto::data_set::data_set_value::Value;
    match value {
        Value::IntValue(v) => serde_json::json!(v),
        Value::LongValue(v) => serde_json::json!(v),
        Value::FloatValue(v) => serde_json::json!(v),
        Value::DoubleValue(v) => serde_json::json!(v),
        Value::BooleanValue(v) => serde_json::json!(v),
        Value::StringValue(v) => serde_json::json!(v),
    }
}

/// Copy a property set into the typed map, preserving declared types.
///
/// Properties with a type outside the supported set are skipped; the metric
/// is otherwise accepted.
fn decode_properties(
    topic: &SparkplugTopic,
    metric_context: &str,
    properties: Option<&proto::PropertySet>,
) -> BTreeMap<String, PropertyValue> {
    let mut out = BTreeMap::new();
    let Some(set) = properties else {
        return out;
    };

    for (key, value) in set.keys.iter().zip(set.values.iter()) {
        if value.is_null.unwrap_or(false) {
            continue;
        }
        match decode_property_value(value) {
            Ok(Some(decoded)) => {
                out.insert(key.clone(), decoded);
            }
            Ok(None) => {}
            Err(err) => {
                metrics().decode_property_skipped.inc();
                warn!(
                    group = %topic.group,
                    edge = %topic.edge,
                    device = topic.device.as_deref().unwrap_or(""),
                    metric = %metric_context,
                    key = %key,
                    error = %err,
                    "skipping property with unsupported datatype"
                );
            }
        }
    }
    out
}

fn decode_property_value(value: &proto::PropertyValue) -> Result<Option<PropertyValue>> {
    use proto::property_value::Value;

    let declared = value.r#type.unwrap_or(0);
    let Some(raw) = value.value.as_ref() else {
        return Ok(None);
    };

    let decoded = match (declared, raw) {
        // Int8/Int16/Int32 and the narrow unsigned types all land in the
        // 32-bit column.
        (1..=3 | 5 | 6, Value::IntValue(v)) => PropertyValue::Int(*v as i32),
        (1..=3 | 5 | 6, Value::LongValue(v)) => PropertyValue::Int(*v as i32),
        // Int64/UInt32/UInt64 widen to the 64-bit column.
        (4 | 7 | 8, Value::IntValue(v)) => PropertyValue::Long(i64::from(*v)),
        (4 | 7 | 8, Value::LongValue(v)) => PropertyValue::Long(*v as i64),
        (9, Value::FloatValue(v)) => PropertyValue::Float(*v),
        (10, Value::DoubleValue(v)) => PropertyValue::Double(*v),
        (11, Value::BooleanValue(v)) => PropertyValue::Bool(*v),
        (12 | 13 | 14 | 15, Value::StringValue(v)) => PropertyValue::String(v.clone()),
        // Untyped values fall back to the wire variant.
        (0, Value::IntValue(v)) => PropertyValue::Int(*v as i32),
        (0, Value::LongValue(v)) => PropertyValue::Long(*v as i64),
        (0, Value::FloatValue(v)) => PropertyValue::Float(*v),
        (0, Value::DoubleValue(v)) => PropertyValue::Double(*v),
        (0, Value::BooleanValue(v)) => PropertyValue::Bool(*v),
        (0, Value::StringValue(v)) => PropertyValue::String(v.clone()),
        (datatype, _) => {
            return Err(Error::UnsupportedDatatype {
                datatype,
                context: "property".to_string(),
            })
        }
    };
    Ok(Some(decoded))
}
