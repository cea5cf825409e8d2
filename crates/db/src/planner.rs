//! Upsert planner.
//!
//! Compares a decoded, name-resolved, normalized frame against the persisted
//! snapshot and emits a plan of device, metric, lineage, and property writes.
//! Planning is pure: repeated invocation with identical input yields `NoOp`
//! everywhere, which is what makes duplicate frames idempotent at the store.

use std::collections::BTreeMap;

use serde_json::json;
use sync_core::PropertyValue;

use crate::model::{DeviceInput, DeviceRow, MetricInput, MetricSnapshot};

/// Planned action for the device row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Insert,
    Update,
    NoOp,
}

/// Planned action for the metric row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricAction {
    Insert,
    Update,
    /// Path changed for an existing metric; mandates a lineage row in the
    /// same transaction.
    Rename { old_path: String, new_path: String },
    NoOp,
}

/// Planned action for one property key.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyOp {
    Insert { key: String, value: PropertyValue },
    Update { key: String, value: PropertyValue },
    Delete { key: String },
    NoOp { key: String },
}

impl PropertyOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. }
            | Self::Update { key, .. }
            | Self::Delete { key }
            | Self::NoOp { key } => key,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Self::NoOp { .. })
    }
}

/// Plan for the device row of one frame.
#[derive(Debug, Clone)]
pub struct DevicePlan {
    pub action: DeviceAction,
    pub input: DeviceInput,
    /// Known synthetic key when the device already exists.
    pub device_key: Option<i64>,
}

/// Plan for one metric and its properties.
#[derive(Debug, Clone)]
pub struct MetricPlan {
    pub action: MetricAction,
    pub input: MetricInput,
    /// Known synthetic key when the metric already exists.
    pub metric_key: Option<i64>,
    pub properties: Vec<PropertyOp>,
    /// Structured version diff covering only material changes; `None` when
    /// nothing changed.
    pub diff: Option<serde_json::Value>,
}

impl MetricPlan {
    pub fn is_noop(&self) -> bool {
        self.action == MetricAction::NoOp && self.properties.iter().all(|op| !op.is_write())
    }
}

/// Full plan for one frame.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub device: DevicePlan,
    pub metrics: Vec<MetricPlan>,
}

/// Plan the device write given the persisted row (matched by canonical path
/// or natural key).
pub fn plan_device(input: DeviceInput, existing: Option<&DeviceRow>) -> DevicePlan {
    match existing {
        None => DevicePlan {
            action: DeviceAction::Insert,
            input,
            device_key: None,
        },
        Some(row) => {
            let unchanged = row.group_id == input.group_id
                && row.country == input.country
                && row.business_unit == input.business_unit
                && row.plant == input.plant
                && row.edge == input.edge
                && row.device == input.device
                && row.uns_path == input.uns_path;
            DevicePlan {
                action: if unchanged {
                    DeviceAction::NoOp
                } else {
                    DeviceAction::Update
                },
                input,
                device_key: Some(row.device_key),
            }
        }
    }
}

/// Plan one metric write given its persisted snapshot (matched by canonical
/// path or `(device_key, name)`).
pub fn plan_metric(input: MetricInput, snapshot: Option<&MetricSnapshot>) -> MetricPlan {
    match snapshot {
        None => {
            let properties: Vec<PropertyOp> = input
                .properties
                .iter()
                .map(|(key, value)| PropertyOp::Insert {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            let diff = Some(insert_diff(&input));
            MetricPlan {
                action: MetricAction::Insert,
                input,
                metric_key: None,
                properties,
                diff,
            }
        }
        Some(snapshot) => {
            let row = &snapshot.metric;
            let action = if row.uns_path != input.uns_path {
                MetricAction::Rename {
                    old_path: row.uns_path.clone(),
                    new_path: input.uns_path.clone(),
                }
            } else if row.name != input.name || row.datatype != input.datatype {
                MetricAction::Update
            } else {
                MetricAction::NoOp
            };

            let properties = plan_properties(&input.properties, &snapshot.properties);
            let path_change = match &action {
                MetricAction::Rename { old_path, new_path } => {
                    Some((old_path.clone(), new_path.clone()))
                }
                _ => None,
            };
            let diff = build_update_diff(path_change, &snapshot.properties, &properties);

            MetricPlan {
                action,
                input,
                metric_key: Some(row.metric_key),
                properties,
                diff,
            }
        }
    }
}

/// Key-level property comparison with type-aware equality. Keys absent from
/// the incoming birth set are deleted; `updated_at` is never part of the
/// comparison.
fn plan_properties(
    incoming: &BTreeMap<String, PropertyValue>,
    existing: &BTreeMap<String, PropertyValue>,
) -> Vec<PropertyOp> {
    let mut ops = Vec::with_capacity(incoming.len() + existing.len());
    for (key, value) in incoming {
        match existing.get(key) {
            None => ops.push(PropertyOp::Insert {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(current) if current != value => ops.push(PropertyOp::Update {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(_) => ops.push(PropertyOp::NoOp { key: key.clone() }),
        }
    }
    for key in existing.keys() {
        if !incoming.contains_key(key) {
            ops.push(PropertyOp::Delete { key: key.clone() });
        }
    }
    ops
}

/// Diff document for a freshly inserted metric: the new path plus every
/// property as a fresh value. Shared with the staged bulk path, which only
/// ever inserts.
pub(crate) fn insert_diff(input: &MetricInput) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    for (key, value) in &input.properties {
        properties.insert(
            key.clone(),
            json!({
                "type": value.property_type().as_str(),
                "new": value.to_json(),
            }),
        );
    }
    let mut doc = serde_json::Map::new();
    doc.insert("path".into(), json!({ "new": input.uns_path }));
    if !properties.is_empty() {
        doc.insert("properties".into(), serde_json::Value::Object(properties));
    }
    serde_json::Value::Object(doc)
}

/// Diff document for an existing metric; `None` when nothing material
/// changed.
fn build_update_diff(
    path_change: Option<(String, String)>,
    existing: &BTreeMap<String, PropertyValue>,
    ops: &[PropertyOp],
) -> Option<serde_json::Value> {
    let mut properties = serde_json::Map::new();
    for op in ops {
        match op {
            PropertyOp::Insert { key, value } => {
                properties.insert(
                    key.clone(),
                    json!({
                        "type": value.property_type().as_str(),
                        "new": value.to_json(),
                    }),
                );
            }
            PropertyOp::Update { key, value } => {
                let old = existing.get(key).map(|v| v.to_json());
                properties.insert(
                    key.clone(),
                    json!({
                        "type": value.property_type().as_str(),
                        "old": old,
                        "new": value.to_json(),
                    }),
                );
            }
            PropertyOp::Delete { key } => {
                properties.insert(key.clone(), json!({ "removed": true }));
            }
            PropertyOp::NoOp { .. } => {}
        }
    }

    if path_change.is_none() && properties.is_empty() {
        return None;
    }

    let mut doc = serde_json::Map::new();
    if let Some((old, new)) = path_change {
        doc.insert("path".into(), json!({ "old": old, "new": new }));
    }
    if !properties.is_empty() {
        doc.insert("properties".into(), serde_json::Value::Object(properties));
    }
    Some(serde_json::Value::Object(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn metric_input(path: &str, props: &[(&str, PropertyValue)]) -> MetricInput {
        MetricInput {
            name: "Temperature/PV".into(),
            uns_path: path.into(),
            datatype: "Float".into(),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn snapshot(path: &str, props: &[(&str, PropertyValue)]) -> MetricSnapshot {
        MetricSnapshot {
            metric: crate::model::MetricRow {
                metric_key: 42,
                device_key: 7,
                name: "Temperature/PV".into(),
                uns_path: path.into(),
                canary_id: path.replace('/', "."),
                datatype: "Float".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn first_sighting_plans_insert_with_full_diff() {
        let input = metric_input(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[
                ("engUnit", PropertyValue::String("°C".into())),
                ("displayHigh", PropertyValue::Int(1800)),
            ],
        );
        let plan = plan_metric(input, None);
        assert_eq!(plan.action, MetricAction::Insert);
        assert_eq!(plan.properties.len(), 2);
        let diff = plan.diff.unwrap();
        assert_eq!(
            diff["properties"]["displayHigh"]["new"],
            serde_json::json!(1800)
        );
    }

    #[test]
    fn identical_input_is_noop_everywhere() {
        let props = [
            ("engUnit", PropertyValue::String("°C".into())),
            ("displayHigh", PropertyValue::Int(1800)),
        ];
        let input = metric_input("Secil/EdgeA/DeviceA/Temperature/PV", &props);
        let snap = snapshot("Secil/EdgeA/DeviceA/Temperature/PV", &props);

        let plan = plan_metric(input, Some(&snap));
        assert_eq!(plan.action, MetricAction::NoOp);
        assert!(plan.is_noop());
        assert!(plan.diff.is_none());
    }

    #[test]
    fn property_change_plans_update_with_old_and_new() {
        let snap = snapshot(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[("displayHigh", PropertyValue::Int(1800))],
        );
        let input = metric_input(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[("displayHigh", PropertyValue::Int(2000))],
        );

        let plan = plan_metric(input, Some(&snap));
        assert_eq!(plan.action, MetricAction::NoOp);
        assert!(!plan.is_noop());
        let diff = plan.diff.unwrap();
        assert_eq!(diff["properties"]["displayHigh"]["old"], serde_json::json!(1800));
        assert_eq!(diff["properties"]["displayHigh"]["new"], serde_json::json!(2000));
        assert_eq!(
            diff["properties"]["displayHigh"]["type"],
            serde_json::json!("int")
        );
    }

    #[test]
    fn type_change_on_same_numeric_value_is_a_change() {
        let snap = snapshot(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[("limit", PropertyValue::Int(5))],
        );
        let input = metric_input(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[("limit", PropertyValue::Long(5))],
        );
        let plan = plan_metric(input, Some(&snap));
        assert!(matches!(plan.properties[0], PropertyOp::Update { .. }));
    }

    #[test]
    fn path_change_plans_rename() {
        let snap = snapshot("Secil/EdgeA/DeviceA/Temperature/PV", &[]);
        let input = MetricInput {
            name: "Temperature/Process".into(),
            uns_path: "Secil/EdgeA/DeviceA/Temperature/Process".into(),
            datatype: "Float".into(),
            properties: BTreeMap::new(),
        };
        let plan = plan_metric(input, Some(&snap));
        assert_eq!(
            plan.action,
            MetricAction::Rename {
                old_path: "Secil/EdgeA/DeviceA/Temperature/PV".into(),
                new_path: "Secil/EdgeA/DeviceA/Temperature/Process".into(),
            }
        );
        let diff = plan.diff.unwrap();
        assert_eq!(
            diff["path"]["old"],
            serde_json::json!("Secil/EdgeA/DeviceA/Temperature/PV")
        );
        assert_eq!(plan.metric_key, Some(42));
    }

    #[test]
    fn absent_property_plans_delete() {
        let snap = snapshot(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[
                ("engUnit", PropertyValue::String("°C".into())),
                ("stale", PropertyValue::Bool(true)),
            ],
        );
        let input = metric_input(
            "Secil/EdgeA/DeviceA/Temperature/PV",
            &[("engUnit", PropertyValue::String("°C".into()))],
        );

        let plan = plan_metric(input, Some(&snap));
        let deletes: Vec<&PropertyOp> = plan
            .properties
            .iter()
            .filter(|op| matches!(op, PropertyOp::Delete { .. }))
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].key(), "stale");
        let diff = plan.diff.unwrap();
        assert_eq!(diff["properties"]["stale"]["removed"], serde_json::json!(true));
    }

    #[test]
    fn device_plan_detects_field_changes() {
        let input = DeviceInput {
            group_id: "Secil".into(),
            country: "PT".into(),
            business_unit: "Cement".into(),
            plant: "Outao".into(),
            edge: "EdgeA".into(),
            device: "DeviceA".into(),
            uns_path: "Secil/EdgeA/DeviceA".into(),
        };
        assert_eq!(plan_device(input.clone(), None).action, DeviceAction::Insert);

        let row = DeviceRow {
            device_key: 7,
            group_id: "Secil".into(),
            country: "PT".into(),
            business_unit: "Cement".into(),
            plant: "Outao".into(),
            edge: "EdgeA".into(),
            device: "DeviceA".into(),
            uns_path: "Secil/EdgeA/DeviceA".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            plan_device(input.clone(), Some(&row)).action,
            DeviceAction::NoOp
        );

        let moved = DeviceInput {
            plant: "Maceira".into(),
            ..input
        };
        let plan = plan_device(moved, Some(&row));
        assert_eq!(plan.action, DeviceAction::Update);
        assert_eq!(plan.device_key, Some(7));
    }
}
