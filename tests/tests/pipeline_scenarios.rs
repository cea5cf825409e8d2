//! End-to-end pipeline scenarios over in-process stages: decode →
//! normalize → plan, and plan diff → debounce → egress payload. No broker,
//! database, or historian required.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::Utc;

use canary::{PayloadMapper, QUALITY_GOOD};
use cdc::{flatten_version_diff, DebounceBuffer, DiffEvent};
use integration_tests::fixtures;
use metadata_db::{
    plan_device, plan_metric, DeviceInput, MetricAction, MetricInput, MetricSnapshot,
};
use sparkplug::{AliasCache, AliasResolution, RebirthThrottle, SparkplugTopic};
use sync_core::{
    classify_property, normalize_device_path, normalize_metric_path, to_canary_id, MessageType,
    PropertyValue,
};

fn decode_birth(display_high: i32) -> sync_core::DecodedFrame {
    let topic = SparkplugTopic::parse("spBv1.0/Secil/DBIRTH/EdgeA/DeviceA").unwrap();
    let payload = fixtures::device_birth_payload(display_high);
    sparkplug::decode_frame(&topic, &payload).unwrap()
}

/// Derive the planner inputs the way the ingest stage does.
fn derive_inputs(frame: &sync_core::DecodedFrame) -> (DeviceInput, Vec<MetricInput>) {
    let device = frame.device.as_deref().unwrap();
    let device_path = normalize_device_path(&frame.group, &frame.edge, Some(device)).unwrap();

    let dimension = |key: &str| {
        frame
            .metrics
            .iter()
            .find(|m| m.name.as_deref() == Some(key))
            .and_then(|m| match &m.value {
                Some(sync_core::MetricValue::String(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap()
    };

    let device_input = DeviceInput {
        group_id: frame.group.clone(),
        country: dimension("country"),
        business_unit: dimension("business_unit"),
        plant: dimension("plant"),
        edge: frame.edge.clone(),
        device: device.to_string(),
        uns_path: device_path,
    };

    let metric_inputs = frame
        .metrics
        .iter()
        .filter(|m| {
            m.name
                .as_deref()
                .is_some_and(|n| !["country", "business_unit", "plant"].contains(&n))
        })
        .map(|metric| {
            let name = metric.name.clone().unwrap();
            let uns_path =
                normalize_metric_path(&frame.group, &frame.edge, Some(device), &name).unwrap();
            MetricInput {
                name,
                uns_path,
                datatype: metric.datatype.clone().unwrap(),
                properties: metric
                    .properties
                    .iter()
                    .filter_map(|(k, v)| classify_property(v).map(|v| (k.clone(), v)))
                    .collect(),
            }
        })
        .collect();

    (device_input, metric_inputs)
}

/// Pretend the plan was applied and build the resulting snapshot.
fn snapshot_after(input: &MetricInput, metric_key: i64, device_key: i64) -> MetricSnapshot {
    MetricSnapshot {
        metric: metadata_db::MetricRow {
            metric_key,
            device_key,
            name: input.name.clone(),
            uns_path: input.uns_path.clone(),
            canary_id: input.uns_path.replace('/', "."),
            datatype: input.datatype.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        },
        properties: input.properties.clone(),
    }
}

#[test]
fn first_birth_plans_device_metric_and_properties() {
    let frame = decode_birth(1800);
    assert_eq!(frame.message_type, MessageType::Dbirth);

    let (device_input, metric_inputs) = derive_inputs(&frame);
    assert_eq!(device_input.uns_path, "Secil/EdgeA/DeviceA");
    assert_eq!(device_input.country, "PT");

    let device_plan = plan_device(device_input, None);
    assert_eq!(device_plan.action, metadata_db::DeviceAction::Insert);

    assert_eq!(metric_inputs.len(), 1);
    let metric_plan = plan_metric(metric_inputs[0].clone(), None);
    assert_eq!(metric_plan.action, MetricAction::Insert);
    assert_eq!(metric_plan.properties.len(), 2);

    // Path-to-tag law: the tag id is exactly the slash path with dots.
    let canary_id = to_canary_id(&metric_plan.input.uns_path).unwrap();
    assert_eq!(canary_id, "Secil.EdgeA.DeviceA.Temperature.PV");
    assert_eq!(
        canary_id,
        metric_plan.input.uns_path.replace('/', ".")
    );
}

#[test]
fn reingesting_the_identical_frame_is_a_noop() {
    let frame = decode_birth(1800);
    let (device_input, metric_inputs) = derive_inputs(&frame);

    let snapshot = snapshot_after(&metric_inputs[0], 42, 7);
    let device_row = metadata_db::DeviceRow {
        device_key: 7,
        group_id: device_input.group_id.clone(),
        country: device_input.country.clone(),
        business_unit: device_input.business_unit.clone(),
        plant: device_input.plant.clone(),
        edge: device_input.edge.clone(),
        device: device_input.device.clone(),
        uns_path: device_input.uns_path.clone(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    let device_plan = plan_device(device_input, Some(&device_row));
    assert_eq!(device_plan.action, metadata_db::DeviceAction::NoOp);

    let metric_plan = plan_metric(metric_inputs[0].clone(), Some(&snapshot));
    assert!(metric_plan.is_noop());
    assert!(metric_plan.diff.is_none());
}

#[test]
fn property_change_flows_to_a_single_minimal_egress_payload() {
    // Persisted state from the first birth, then a birth with displayHigh
    // bumped to 2000.
    let first = decode_birth(1800);
    let (_, first_inputs) = derive_inputs(&first);
    let snapshot = snapshot_after(&first_inputs[0], 42, 7);

    let second = decode_birth(2000);
    let (_, second_inputs) = derive_inputs(&second);
    let plan = plan_metric(second_inputs[0].clone(), Some(&snapshot));

    let diff_doc = plan.diff.expect("material change must produce a diff");
    assert_eq!(
        diff_doc["properties"]["displayHigh"],
        serde_json::json!({"type": "int", "old": 1800, "new": 2000})
    );

    // The CDC stage flattens the version diff and debounces it.
    let changes = flatten_version_diff(&diff_doc);
    assert_eq!(changes.len(), 1);

    let mut buffer = DebounceBuffer::new(Duration::from_secs(180), 100);
    let start = Instant::now();
    buffer.add(
        &DiffEvent {
            event_id: "42:9".into(),
            metric_key: 42,
            uns_path: snapshot.metric.uns_path.clone(),
            canary_id: snapshot.metric.canary_id.clone(),
            version: 9,
            actor: "uns-metadata-sync".into(),
            changes,
            changed_at: Utc::now(),
            lsn: 1000,
        },
        start,
    );
    let flushed = buffer.flush_expired(start + Duration::from_secs(180));
    assert_eq!(flushed.len(), 1);

    // Egress mapping: only the changed key, fixed quality, no samples.
    let mapper = PayloadMapper::new(100, 1_000_000);
    let (batches, rejected) = mapper.build_batches(flushed, Utc::now());
    assert!(rejected.is_empty());
    let body = batches[0].body("session-token");
    let entries = body["properties"]["Secil.EdgeA.DeviceA.Temperature.PV"]
        .as_array()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0][1], serde_json::json!("displayHigh=2000"));
    assert_eq!(entries[0][2], serde_json::json!(QUALITY_GOOD));
}

#[test]
fn rename_keeps_the_metric_key_and_routes_to_the_new_tag() {
    let first = decode_birth(1800);
    let (_, first_inputs) = derive_inputs(&first);
    let snapshot = snapshot_after(&first_inputs[0], 42, 7);

    let renamed = MetricInput {
        name: "Temperature/Process".into(),
        uns_path: "Secil/EdgeA/DeviceA/Temperature/Process".into(),
        datatype: "Float".into(),
        properties: first_inputs[0].properties.clone(),
    };
    let plan = plan_metric(renamed, Some(&snapshot));

    // Identity preserved, lineage mandated by the rename action.
    assert_eq!(plan.metric_key, Some(42));
    assert_eq!(
        plan.action,
        MetricAction::Rename {
            old_path: "Secil/EdgeA/DeviceA/Temperature/PV".into(),
            new_path: "Secil/EdgeA/DeviceA/Temperature/Process".into(),
        }
    );

    // The flattened diff carries the new path, and the egress payload is
    // addressed at the new dot-path.
    let changes = flatten_version_diff(&plan.diff.unwrap());
    let mut buffer = DebounceBuffer::new(Duration::from_secs(1), 10);
    let start = Instant::now();
    buffer.add(
        &DiffEvent {
            event_id: "42:10".into(),
            metric_key: 42,
            uns_path: "Secil/EdgeA/DeviceA/Temperature/Process".into(),
            canary_id: "Secil.EdgeA.DeviceA.Temperature.Process".into(),
            version: 10,
            actor: "uns-metadata-sync".into(),
            changes,
            changed_at: Utc::now(),
            lsn: 2000,
        },
        start,
    );
    let flushed = buffer.flush_expired(start + Duration::from_secs(2));

    let mapper = PayloadMapper::new(100, 1_000_000);
    let (batches, _) = mapper.build_batches(flushed, Utc::now());
    let body = batches[0].body("session-token");
    assert!(body["properties"]
        .get("Secil.EdgeA.DeviceA.Temperature.Process")
        .is_some());
    assert!(body["properties"]
        .get("Secil.EdgeA.DeviceA.Temperature.PV")
        .is_none());
}

#[test]
fn alias_only_frame_gets_a_placeholder_and_one_rebirth() {
    let topic = SparkplugTopic::parse("spBv1.0/Secil/DDATA/EdgeA/DeviceA").unwrap();
    let payload = fixtures::encode_payload(vec![fixtures::alias_only_metric(17, 1.0)]);
    let frame = sparkplug::decode_frame(&topic, &payload).unwrap();

    let metric = &frame.metrics[0];
    assert_eq!(metric.name, None);
    assert_eq!(metric.identity(), "alias:17");

    let dir = tempfile::tempdir().unwrap();
    let cache = AliasCache::load(dir.path().join("alias.json"));
    assert_eq!(
        cache.resolve("Secil", "EdgeA", Some("DeviceA"), 17),
        AliasResolution::Missing
    );

    // One rebirth per (group, edge, device) until the cooldown elapses or a
    // birth arrives.
    let throttle = RebirthThrottle::new(Duration::from_secs(60));
    assert!(throttle.try_acquire("Secil", "EdgeA", Some("DeviceA")));
    assert!(!throttle.try_acquire("Secil", "EdgeA", Some("DeviceA")));
    assert!(!throttle.try_acquire("Secil", "EdgeA", Some("DeviceA")));

    // The birth clears the throttle and the alias resolves afterwards.
    throttle.clear("Secil", "EdgeA", Some("DeviceA"));
    cache.populate(
        "Secil",
        "EdgeA",
        Some("DeviceA"),
        17,
        sparkplug::AliasEntry {
            name: "Temperature/PV".into(),
            datatype: Some("Float".into()),
        },
    );
    assert_eq!(
        cache.resolve("Secil", "EdgeA", Some("DeviceA"), 17),
        AliasResolution::Known("Temperature/PV".into())
    );
}

#[test]
fn bulk_and_per_row_inputs_share_the_same_typing_rules() {
    // Property classification is identical regardless of the write path.
    let wide = PropertyValue::Long(4_000_000_000);
    let narrow = PropertyValue::Long(1800);
    assert_eq!(classify_property(&wide), Some(PropertyValue::Long(4_000_000_000)));
    assert_eq!(classify_property(&narrow), Some(PropertyValue::Int(1800)));

    let mut properties = BTreeMap::new();
    properties.insert("engUnit".to_string(), PropertyValue::String("°C".into()));
    let input = MetricInput {
        name: "M".into(),
        uns_path: "Secil/EdgeA/DeviceA/M".into(),
        datatype: "Float".into(),
        properties,
    };
    let plan = plan_metric(input, None);
    for op in &plan.properties {
        assert!(matches!(op, metadata_db::PropertyOp::Insert { .. }));
    }
}
