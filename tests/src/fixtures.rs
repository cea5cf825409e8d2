//! Shared builders for pipeline tests: Sparkplug payload bytes and decoded
//! frames with realistic birth content.

use prost::Message;
use sparkplug::proto;

/// Encode a property set from `(key, value)` pairs.
pub fn property_set(entries: &[(&str, proto::property_value::Value, u32)]) -> proto::PropertySet {
    proto::PropertySet {
        keys: entries.iter().map(|(key, _, _)| key.to_string()).collect(),
        values: entries
            .iter()
            .map(|(_, value, ty)| proto::PropertyValue {
                r#type: Some(*ty),
                is_null: None,
                value: Some(value.clone()),
            })
            .collect(),
    }
}

/// A named string metric (used for classification dimensions).
pub fn string_metric(name: &str, value: &str) -> proto::Metric {
    proto::Metric {
        name: Some(name.to_string()),
        alias: None,
        timestamp: None,
        datatype: Some(12),
        is_historical: None,
        is_transient: None,
        is_null: None,
        properties: None,
        value: Some(proto::metric::Value::StringValue(value.to_string())),
    }
}

/// A float metric with properties and an alias declaration.
pub fn float_metric(
    name: &str,
    alias: u64,
    value: f32,
    properties: Option<proto::PropertySet>,
) -> proto::Metric {
    proto::Metric {
        name: Some(name.to_string()),
        alias: Some(alias),
        timestamp: None,
        datatype: Some(9),
        is_historical: None,
        is_transient: None,
        is_null: None,
        properties,
        value: Some(proto::metric::Value::FloatValue(value)),
    }
}

/// A metric referencing its alias only (data-frame style).
pub fn alias_only_metric(alias: u64, value: f32) -> proto::Metric {
    proto::Metric {
        name: None,
        alias: Some(alias),
        timestamp: None,
        datatype: Some(9),
        is_historical: None,
        is_transient: None,
        is_null: None,
        properties: None,
        value: Some(proto::metric::Value::FloatValue(value)),
    }
}

/// Encode a payload envelope for the given metrics.
pub fn encode_payload(metrics: Vec<proto::Metric>) -> Vec<u8> {
    let payload = proto::Payload {
        timestamp: Some(1_700_000_000_000),
        metrics,
        seq: Some(0),
        uuid: None,
        body: None,
    };
    payload.encode_to_vec()
}

/// Full device-birth payload: classification dimensions plus one
/// temperature metric with unit and display-range properties.
pub fn device_birth_payload(display_high: i32) -> Vec<u8> {
    encode_payload(vec![
        string_metric("country", "PT"),
        string_metric("business_unit", "Cement"),
        string_metric("plant", "Outao"),
        float_metric(
            "Temperature/PV",
            4,
            812.5,
            Some(property_set(&[
                (
                    "engUnit",
                    proto::property_value::Value::StringValue("°C".into()),
                    12,
                ),
                ("displayHigh", proto::property_value::Value::IntValue(display_high as u32), 3),
            ])),
        ),
    ])
}
