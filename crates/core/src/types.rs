//! Shared data model for decoded Sparkplug frames and typed metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sparkplug message types as they appear in the topic's third segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Nbirth,
    Dbirth,
    Ndata,
    Ddata,
    Ndeath,
    Ddeath,
    Ncmd,
    Dcmd,
    State,
    Unknown,
}

impl MessageType {
    pub fn from_segment(segment: &str) -> Self {
        match segment.to_ascii_uppercase().as_str() {
            "NBIRTH" => Self::Nbirth,
            "DBIRTH" => Self::Dbirth,
            "NDATA" => Self::Ndata,
            "DDATA" => Self::Ddata,
            "NDEATH" => Self::Ndeath,
            "DDEATH" => Self::Ddeath,
            "NCMD" => Self::Ncmd,
            "DCMD" => Self::Dcmd,
            "STATE" => Self::State,
            _ => Self::Unknown,
        }
    }

    /// Birth frames carry the full metric set and populate alias maps.
    pub fn is_birth(&self) -> bool {
        matches!(self, Self::Nbirth | Self::Dbirth)
    }

    /// Device-scoped frames carry a device segment in the topic.
    pub fn is_device_scoped(&self) -> bool {
        matches!(self, Self::Dbirth | Self::Ddata | Self::Ddeath | Self::Dcmd)
    }
}

/// Property value types accepted by the typed-column store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Int,
    Long,
    Float,
    Double,
    String,
    Boolean,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::String => "string",
            Self::Boolean => "boolean",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "int" => Some(Self::Int),
            "long" => Some(Self::Long),
            "float" => Some(Self::Float),
            "double" => Some(Self::Double),
            "string" => Some(Self::String),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }
}

/// One typed property value. Exactly one variant maps to exactly one typed
/// value column in the store, which is what keeps the typing invariant
/// checkable before a row is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
}

impl PropertyValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Self::Int(_) => PropertyType::Int,
            Self::Long(_) => PropertyType::Long,
            Self::Float(_) => PropertyType::Float,
            Self::Double(_) => PropertyType::Double,
            Self::Bool(_) => PropertyType::Boolean,
            Self::String(_) => PropertyType::String,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::json!(v),
            Self::Long(v) => serde_json::json!(v),
            Self::Float(v) => serde_json::json!(v),
            Self::Double(v) => serde_json::json!(v),
            Self::Bool(v) => serde_json::json!(v),
            Self::String(v) => serde_json::json!(v),
        }
    }
}

/// Metric value variants carried by decoded frames.
///
/// Dataset values are flattened to a stable `{columns, rows}` shape and not
/// decoded beyond that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Dataset(DatasetValue),
}

/// Flattened Sparkplug dataset value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetValue {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Canonical datatype name for a Sparkplug datatype code.
pub fn datatype_name(code: u32) -> Option<&'static str> {
    Some(match code {
        1 => "Int8",
        2 => "Int16",
        3 => "Int32",
        4 => "Int64",
        5 => "UInt8",
        6 => "UInt16",
        7 => "UInt32",
        8 => "UInt64",
        9 => "Float",
        10 => "Double",
        11 => "Boolean",
        12 => "String",
        13 => "DateTime",
        14 => "Text",
        15 => "UUID",
        16 => "DataSet",
        17 => "Bytes",
        18 => "File",
        _ => return None,
    })
}

/// One metric entry from a decoded frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedMetric {
    /// Declared metric name. Absent when the frame references an alias only.
    pub name: Option<String>,
    /// Sparkplug alias id, when declared.
    pub alias: Option<u64>,
    /// Canonical datatype name; `None` when the code is outside the
    /// enumerated set.
    pub datatype: Option<String>,
    /// Metric-level timestamp (epoch millis), when present.
    pub timestamp: Option<u64>,
    pub value: Option<MetricValue>,
    /// Per-metric property metadata with the declared per-property types
    /// preserved. Ordered so diffing and serialization are deterministic.
    pub properties: BTreeMap<String, PropertyValue>,
}

impl DecodedMetric {
    /// Resolved display identity: the declared name or the alias placeholder.
    pub fn identity(&self) -> String {
        match (&self.name, self.alias) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(alias)) => format!("alias:{alias}"),
            _ => String::new(),
        }
    }
}

/// A fully decoded Sparkplug frame with topic identity attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedFrame {
    pub group: String,
    pub message_type: MessageType,
    pub edge: String,
    pub device: Option<String>,
    /// Frame-level timestamp (epoch millis), when present.
    pub timestamp: Option<u64>,
    pub metrics: Vec<DecodedMetric>,
}

impl DecodedFrame {
    /// The alias-map scope for this frame: device-scoped for D* frames,
    /// node-scoped otherwise.
    pub fn alias_device(&self) -> Option<&str> {
        if self.message_type.is_device_scoped() {
            self.device.as_deref()
        } else {
            None
        }
    }
}

/// Derive the typed property value for a raw birth-frame property.
///
/// Integers fit `int` when within i32 range and promote to `long` otherwise;
/// floats persist as `double`; blank strings carry no information and are
/// dropped by returning `None`.
pub fn classify_property(value: &PropertyValue) -> Option<PropertyValue> {
    match value {
        PropertyValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(PropertyValue::String(trimmed.to_string()))
            }
        }
        PropertyValue::Long(v) => {
            if i32::try_from(*v).is_ok() {
                Some(PropertyValue::Int(*v as i32))
            } else {
                Some(PropertyValue::Long(*v))
            }
        }
        other => Some(other.clone()),
    }
}

/// Validate that a declared type string matches the value variant, surfacing
/// the typing invariant violation before it can reach the store.
pub fn check_property_typing(declared: &str, value: &PropertyValue) -> Result<PropertyType> {
    let ty = PropertyType::parse(declared).ok_or_else(|| Error::UnsupportedDatatype {
        datatype: 0,
        context: format!("property type '{declared}'"),
    })?;
    if value.property_type() != ty {
        return Err(Error::constraint(
            declared.to_string(),
            format!(
                "declared type {} does not match value type {}",
                ty.as_str(),
                value.property_type().as_str()
            ),
        ));
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_parses_case_insensitively() {
        assert_eq!(MessageType::from_segment("DBIRTH"), MessageType::Dbirth);
        assert_eq!(MessageType::from_segment("nbirth"), MessageType::Nbirth);
        assert_eq!(MessageType::from_segment("bogus"), MessageType::Unknown);
        assert!(MessageType::Dbirth.is_birth());
        assert!(!MessageType::Ddata.is_birth());
    }

    #[test]
    fn property_value_reports_matching_type() {
        assert_eq!(
            PropertyValue::Int(1800).property_type(),
            PropertyType::Int
        );
        assert_eq!(
            PropertyValue::String("°C".into()).property_type(),
            PropertyType::String
        );
    }

    #[test]
    fn classify_promotes_wide_integers_to_long() {
        assert_eq!(
            classify_property(&PropertyValue::Long(1800)),
            Some(PropertyValue::Int(1800))
        );
        assert_eq!(
            classify_property(&PropertyValue::Long(4_000_000_000)),
            Some(PropertyValue::Long(4_000_000_000))
        );
    }

    #[test]
    fn classify_drops_blank_strings() {
        assert_eq!(classify_property(&PropertyValue::String("  ".into())), None);
        assert_eq!(
            classify_property(&PropertyValue::String("  °C ".into())),
            Some(PropertyValue::String("°C".into()))
        );
    }

    #[test]
    fn typing_check_rejects_mismatches() {
        let err = check_property_typing("int", &PropertyValue::String("x".into()));
        assert!(err.is_err());
        let ty = check_property_typing("string", &PropertyValue::String("x".into())).unwrap();
        assert_eq!(ty, PropertyType::String);
    }

    #[test]
    fn alias_placeholder_identity() {
        let metric = DecodedMetric {
            name: None,
            alias: Some(17),
            datatype: None,
            timestamp: None,
            value: None,
            properties: BTreeMap::new(),
        };
        assert_eq!(metric.identity(), "alias:17");
    }
}
