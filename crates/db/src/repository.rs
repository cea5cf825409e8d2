//! Metadata repository: transactional, idempotent writes to the relational
//! store.
//!
//! `apply_plan` executes device, metric, lineage, property, and version
//! writes for one frame inside a single transaction so other observers never
//! see partial state. The staged bulk path for high-fan-out births lives in
//! `bulk.rs`.

use std::collections::BTreeMap;

use sqlx::{PgPool, Postgres, Transaction};
use sync_core::{Error, PropertyValue, Result};
use telemetry::metrics;

use crate::client::{map_db_err, with_retries};
use crate::model::{
    DeviceNaturalKey, DeviceRow, MetricRow, MetricSnapshot, Outcome, PropertyRow,
};
use crate::planner::{DeviceAction, FramePlan, MetricAction, MetricPlan, PropertyOp};

/// Actor recorded on version rows written by the pipeline.
pub(crate) const CHANGED_BY: &str = "uns-metadata-sync";

/// Typed column values for one property row, in declaration order.
type PropertyColumns = (
    Option<i32>,
    Option<i64>,
    Option<f32>,
    Option<f64>,
    Option<String>,
    Option<bool>,
);

/// Spread a typed value across the six value columns; exactly one is `Some`.
pub(crate) fn property_columns(value: &PropertyValue) -> PropertyColumns {
    match value {
        PropertyValue::Int(v) => (Some(*v), None, None, None, None, None),
        PropertyValue::Long(v) => (None, Some(*v), None, None, None, None),
        PropertyValue::Float(v) => (None, None, Some(*v), None, None, None),
        PropertyValue::Double(v) => (None, None, None, Some(*v), None, None),
        PropertyValue::String(v) => (None, None, None, None, Some(v.clone()), None),
        PropertyValue::Bool(v) => (None, None, None, None, None, Some(*v)),
    }
}

/// Repository over the metadata store.
#[derive(Clone)]
pub struct MetadataRepository {
    pool: PgPool,
    schema: String,
}

impl MetadataRepository {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn schema(&self) -> &str {
        &self.schema
    }

    // ------------------------------------------------------------------ snapshots

    /// Current device row, matched by canonical path first and natural key
    /// second (a path change must not mint a second row for the same
    /// device).
    pub async fn snapshot_device(
        &self,
        uns_path: &str,
        natural_key: &DeviceNaturalKey,
    ) -> Result<Option<DeviceRow>> {
        with_retries("snapshot_device", || async {
            let by_path = sqlx::query_as::<_, DeviceRow>(&format!(
                "SELECT device_key, group_id, country, business_unit, plant, edge, device, \
                 uns_path, created_at, updated_at \
                 FROM {}.devices WHERE uns_path = $1",
                self.schema
            ))
            .bind(uns_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_db_err(uns_path, err))?;
            if by_path.is_some() {
                return Ok(by_path);
            }

            sqlx::query_as::<_, DeviceRow>(&format!(
                "SELECT device_key, group_id, country, business_unit, plant, edge, device, \
                 uns_path, created_at, updated_at \
                 FROM {}.devices WHERE group_id = $1 AND edge = $2 AND device = $3",
                self.schema
            ))
            .bind(&natural_key.group_id)
            .bind(&natural_key.edge)
            .bind(&natural_key.device)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_db_err(&natural_key.group_id, err))
        })
        .await
    }

    /// Current metric row plus properties, matched by canonical path first
    /// and `(device_key, name)` second — the latter is how renames are
    /// detected.
    pub async fn snapshot_metric(
        &self,
        device_key: i64,
        name: &str,
        uns_path: &str,
    ) -> Result<Option<MetricSnapshot>> {
        with_retries("snapshot_metric", || async {
            let by_path = sqlx::query_as::<_, MetricRow>(&format!(
                "SELECT metric_key, device_key, name, uns_path, canary_id, datatype, \
                 created_at, updated_at \
                 FROM {}.metrics WHERE uns_path = $1",
                self.schema
            ))
            .bind(uns_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| map_db_err(uns_path, err))?;

            let row = match by_path {
                Some(row) => Some(row),
                None => sqlx::query_as::<_, MetricRow>(&format!(
                    "SELECT metric_key, device_key, name, uns_path, canary_id, datatype, \
                     created_at, updated_at \
                     FROM {}.metrics WHERE device_key = $1 AND name = $2",
                    self.schema
                ))
                .bind(device_key)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| map_db_err(name, err))?,
            };

            let Some(metric) = row else {
                return Ok(None);
            };
            let properties = self.load_properties(metric.metric_key).await?;
            Ok(Some(MetricSnapshot { metric, properties }))
        })
        .await
    }

    async fn load_properties(&self, metric_key: i64) -> Result<BTreeMap<String, PropertyValue>> {
        let rows = sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT metric_key, key, type, value_int, value_long, value_float, value_double, \
             value_string, value_bool, updated_at \
             FROM {}.metric_properties WHERE metric_key = $1",
            self.schema
        ))
        .bind(metric_key)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| map_db_err("metric_properties", err))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.value().map(|value| (row.key, value)))
            .collect())
    }

    // ------------------------------------------------------------------ apply

    /// Execute one frame plan in a single transaction.
    pub async fn apply_plan(&self, plan: &FramePlan) -> Result<Outcome> {
        with_retries("apply_plan", || async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| map_db_err("begin", err))?;

            let mut outcome = Outcome::default();
            let device_key = self
                .apply_device_tx(&mut tx, &plan.device, &mut outcome)
                .await?;

            for metric_plan in &plan.metrics {
                self.apply_metric(&mut tx, device_key, metric_plan, &mut outcome)
                    .await?;
            }

            tx.commit().await.map_err(|err| map_db_err("commit", err))?;
            metrics().frames_persisted.inc();
            Ok(outcome)
        })
        .await
    }

    pub(crate) async fn apply_device_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plan: &crate::planner::DevicePlan,
        outcome: &mut Outcome,
    ) -> Result<i64> {
        let input = &plan.input;
        match plan.action {
            DeviceAction::Insert => {
                let key: (i64,) = sqlx::query_as(&format!(
                    "INSERT INTO {}.devices \
                     (group_id, country, business_unit, plant, edge, device, uns_path) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING device_key",
                    self.schema
                ))
                .bind(&input.group_id)
                .bind(&input.country)
                .bind(&input.business_unit)
                .bind(&input.plant)
                .bind(&input.edge)
                .bind(&input.device)
                .bind(&input.uns_path)
                .fetch_one(&mut **tx)
                .await
                .map_err(|err| map_db_err(&input.uns_path, err))?;
                outcome.inserted += 1;
                Ok(key.0)
            }
            DeviceAction::Update => {
                let device_key = plan
                    .device_key
                    .ok_or_else(|| Error::internal("device update plan missing device_key"))?;
                sqlx::query(&format!(
                    "UPDATE {}.devices SET group_id = $1, country = $2, business_unit = $3, \
                     plant = $4, edge = $5, device = $6, uns_path = $7 WHERE device_key = $8",
                    self.schema
                ))
                .bind(&input.group_id)
                .bind(&input.country)
                .bind(&input.business_unit)
                .bind(&input.plant)
                .bind(&input.edge)
                .bind(&input.device)
                .bind(&input.uns_path)
                .bind(device_key)
                .execute(&mut **tx)
                .await
                .map_err(|err| map_db_err(&input.uns_path, err))?;
                outcome.updated += 1;
                Ok(device_key)
            }
            DeviceAction::NoOp => {
                outcome.noop += 1;
                plan.device_key
                    .ok_or_else(|| Error::internal("device noop plan missing device_key"))
            }
        }
    }

    async fn apply_metric(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        device_key: i64,
        plan: &MetricPlan,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let input = &plan.input;

        let metric_key = match &plan.action {
            MetricAction::Insert => {
                let key: (i64,) = sqlx::query_as(&format!(
                    "INSERT INTO {}.metrics (device_key, name, uns_path, datatype) \
                     VALUES ($1, $2, $3, $4) RETURNING metric_key",
                    self.schema
                ))
                .bind(device_key)
                .bind(&input.name)
                .bind(&input.uns_path)
                .bind(&input.datatype)
                .fetch_one(&mut **tx)
                .await
                .map_err(|err| map_db_err(&input.uns_path, err))?;
                outcome.inserted += 1;
                key.0
            }
            MetricAction::Update => {
                let metric_key = plan
                    .metric_key
                    .ok_or_else(|| Error::internal("metric update plan missing metric_key"))?;
                sqlx::query(&format!(
                    "UPDATE {}.metrics SET device_key = $1, name = $2, datatype = $3 \
                     WHERE metric_key = $4",
                    self.schema
                ))
                .bind(device_key)
                .bind(&input.name)
                .bind(&input.datatype)
                .bind(metric_key)
                .execute(&mut **tx)
                .await
                .map_err(|err| map_db_err(&input.uns_path, err))?;
                outcome.updated += 1;
                metric_key
            }
            MetricAction::Rename { old_path, new_path } => {
                let metric_key = plan
                    .metric_key
                    .ok_or_else(|| Error::internal("metric rename plan missing metric_key"))?;
                // The lineage row lands before the path update so the rename
                // history can never miss a committed path change.
                self.insert_lineage(tx, metric_key, old_path, new_path).await?;
                sqlx::query(&format!(
                    "UPDATE {}.metrics SET device_key = $1, name = $2, uns_path = $3, \
                     datatype = $4 WHERE metric_key = $5",
                    self.schema
                ))
                .bind(device_key)
                .bind(&input.name)
                .bind(new_path)
                .bind(&input.datatype)
                .bind(metric_key)
                .execute(&mut **tx)
                .await
                .map_err(|err| map_db_err(new_path, err))?;
                outcome.updated += 1;
                metric_key
            }
            MetricAction::NoOp => {
                outcome.noop += 1;
                plan.metric_key
                    .ok_or_else(|| Error::internal("metric noop plan missing metric_key"))?
            }
        };

        for op in &plan.properties {
            self.apply_property(tx, metric_key, op, outcome).await?;
        }

        if let Some(diff) = &plan.diff {
            sqlx::query(&format!(
                "INSERT INTO {}.metric_versions (metric_key, changed_by, diff) \
                 VALUES ($1, $2, $3)",
                self.schema
            ))
            .bind(metric_key)
            .bind(CHANGED_BY)
            .bind(diff)
            .execute(&mut **tx)
            .await
            .map_err(|err| map_db_err(&input.uns_path, err))?;
        }

        Ok(())
    }

    async fn apply_property(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metric_key: i64,
        op: &PropertyOp,
        outcome: &mut Outcome,
    ) -> Result<()> {
        match op {
            PropertyOp::Insert { key, value } | PropertyOp::Update { key, value } => {
                let ty = value.property_type();
                let (v_int, v_long, v_float, v_double, v_string, v_bool) =
                    property_columns(value);
                sqlx::query(&format!(
                    "INSERT INTO {}.metric_properties \
                     (metric_key, key, type, value_int, value_long, value_float, \
                     value_double, value_string, value_bool) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (metric_key, key) DO UPDATE SET \
                     type = EXCLUDED.type, value_int = EXCLUDED.value_int, \
                     value_long = EXCLUDED.value_long, value_float = EXCLUDED.value_float, \
                     value_double = EXCLUDED.value_double, value_string = EXCLUDED.value_string, \
                     value_bool = EXCLUDED.value_bool",
                    self.schema
                ))
                .bind(metric_key)
                .bind(key)
                .bind(ty.as_str())
                .bind(v_int)
                .bind(v_long)
                .bind(v_float)
                .bind(v_double)
                .bind(v_string)
                .bind(v_bool)
                .execute(&mut **tx)
                .await
                .map_err(|err| map_db_err(key, err))?;
                if matches!(op, PropertyOp::Insert { .. }) {
                    outcome.inserted += 1;
                } else {
                    outcome.updated += 1;
                }
            }
            PropertyOp::Delete { key } => {
                sqlx::query(&format!(
                    "DELETE FROM {}.metric_properties WHERE metric_key = $1 AND key = $2",
                    self.schema
                ))
                .bind(metric_key)
                .bind(key)
                .execute(&mut **tx)
                .await
                .map_err(|err| map_db_err(key, err))?;
                outcome.updated += 1;
            }
            PropertyOp::NoOp { .. } => {
                outcome.noop += 1;
            }
        }
        Ok(())
    }

    async fn insert_lineage(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        metric_key: i64,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        if old_path == new_path || old_path.trim().is_empty() {
            return Ok(());
        }
        let inserted = sqlx::query(&format!(
            "INSERT INTO {}.metric_path_lineage (metric_key, old_uns_path, new_uns_path) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (metric_key, old_uns_path, new_uns_path) DO NOTHING",
            self.schema
        ))
        .bind(metric_key)
        .bind(old_path)
        .bind(new_path)
        .execute(&mut **tx)
        .await
        .map_err(|err| map_db_err(old_path, err))?;
        if inserted.rows_affected() > 0 {
            metrics().lineage_rows.inc();
        }
        Ok(())
    }
}
