//! Row and payload types for the metadata store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{PropertyType, PropertyValue};

/// Natural key identifying a device independent of its synthetic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceNaturalKey {
    pub group_id: String,
    pub edge: String,
    pub device: String,
}

/// Incoming device identity derived from a birth frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInput {
    pub group_id: String,
    pub country: String,
    pub business_unit: String,
    pub plant: String,
    pub edge: String,
    pub device: String,
    pub uns_path: String,
}

impl DeviceInput {
    pub fn natural_key(&self) -> DeviceNaturalKey {
        DeviceNaturalKey {
            group_id: self.group_id.clone(),
            edge: self.edge.clone(),
            device: self.device.clone(),
        }
    }
}

/// Incoming metric identity plus its typed property set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricInput {
    pub name: String,
    pub uns_path: String,
    pub datatype: String,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// A persisted device row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRow {
    pub device_key: i64,
    pub group_id: String,
    pub country: String,
    pub business_unit: String,
    pub plant: String,
    pub edge: String,
    pub device: String,
    pub uns_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted metric row. `canary_id` is a generated column and always
/// equals `replace(uns_path, '/', '.')`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MetricRow {
    pub metric_key: i64,
    pub device_key: i64,
    pub name: String,
    pub uns_path: String,
    pub canary_id: String,
    pub datatype: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted property row with its typed value columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PropertyRow {
    pub metric_key: i64,
    pub key: String,
    #[sqlx(rename = "type")]
    pub property_type: String,
    pub value_int: Option<i32>,
    pub value_long: Option<i64>,
    pub value_float: Option<f32>,
    pub value_double: Option<f64>,
    pub value_string: Option<String>,
    pub value_bool: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyRow {
    /// Reconstruct the typed value from whichever column is populated.
    ///
    /// Returns `None` when the row violates the typing invariant, which the
    /// check constraint makes unreachable in practice.
    pub fn value(&self) -> Option<PropertyValue> {
        match PropertyType::parse(&self.property_type)? {
            PropertyType::Int => self.value_int.map(PropertyValue::Int),
            PropertyType::Long => self.value_long.map(PropertyValue::Long),
            PropertyType::Float => self.value_float.map(PropertyValue::Float),
            PropertyType::Double => self.value_double.map(PropertyValue::Double),
            PropertyType::String => self.value_string.clone().map(PropertyValue::String),
            PropertyType::Boolean => self.value_bool.map(PropertyValue::Bool),
        }
    }
}

/// Current persisted state of one metric: the row plus its properties.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub metric: MetricRow,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Write counts reported by `apply_plan`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub inserted: u64,
    pub updated: u64,
    pub noop: u64,
}

impl Outcome {
    pub fn merge(&mut self, other: Outcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.noop += other.noop;
    }
}

/// Write counts reported by the staged bulk path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub metrics_written: u64,
    pub properties_written: u64,
    pub versions_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn property_row(ty: &str) -> PropertyRow {
        PropertyRow {
            metric_key: 1,
            key: "engUnit".into(),
            property_type: ty.into(),
            value_int: None,
            value_long: None,
            value_float: None,
            value_double: None,
            value_string: Some("°C".into()),
            value_bool: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn property_row_reconstructs_typed_value() {
        let row = property_row("string");
        assert_eq!(row.value(), Some(PropertyValue::String("°C".into())));
    }

    #[test]
    fn mismatched_column_yields_none() {
        // Declared int but only the string column is populated.
        let row = property_row("int");
        assert_eq!(row.value(), None);
    }
}
