//! Staged bulk path for high-fan-out births.
//!
//! Large first births (tens of thousands of metrics, an order of magnitude
//! more properties) would drown the per-row path in round trips. This path
//! serves a device's first sighting only — every staged row is an insert —
//! staging rows into per-transaction temporary tables and merging set-wise
//! on the natural unique constraints, with a distinctness predicate so a
//! replayed birth does not touch `updated_at` or bloat indexes. Version
//! rows for the inserted metrics land in the same transaction. Re-births of
//! an existing device take the per-row planner path, which couples property
//! changes to their version and lineage writes. Commit durability is
//! relaxed for the transaction; constraints and the property typing check
//! remain in force.

use std::collections::HashMap;

use sqlx::{Postgres, Transaction};
use sync_core::Result;
use telemetry::metrics;

use crate::client::{map_db_err, with_retries};
use crate::model::{BulkOutcome, MetricInput, Outcome};
use crate::planner::{insert_diff, DevicePlan};
use crate::repository::{property_columns, MetadataRepository, CHANGED_BY};

/// Rows staged per round trip.
const CHUNK: usize = 10_000;

impl MetadataRepository {
    /// Persist one first-birth frame through the staged bulk path.
    ///
    /// The caller routes here only when the device has no persisted state
    /// yet. The device row still goes through the planned per-row write
    /// (there is exactly one per frame); metrics, properties, and their
    /// version rows are staged and merged set-wise inside the same
    /// transaction.
    pub async fn apply_bulk(
        &self,
        device: &DevicePlan,
        metrics_in: &[MetricInput],
    ) -> Result<BulkOutcome> {
        with_retries("apply_bulk", || async {
            let mut tx = self
                .pool()
                .begin()
                .await
                .map_err(|err| map_db_err("begin", err))?;

            // Deferred fsync for the duration of the bulk load; crash
            // recovery re-ingests the birth frame.
            sqlx::query("SET LOCAL synchronous_commit = off")
                .execute(&mut *tx)
                .await
                .map_err(|err| map_db_err("synchronous_commit", err))?;

            // One device row per frame; it reuses the per-row write. Bulk
            // only changes the metric and property strategy.
            let mut device_outcome = Outcome::default();
            let device_key = self
                .apply_device_tx(&mut tx, device, &mut device_outcome)
                .await?;

            let metrics_written = self.merge_metrics(&mut tx, device_key, metrics_in).await?;
            let id_map = self.metric_id_map(&mut tx, device_key, metrics_in).await?;
            let properties_written = self
                .merge_properties(&mut tx, &id_map, metrics_in)
                .await?;
            let versions_written = self.merge_versions(&mut tx, &id_map, metrics_in).await?;

            tx.commit().await.map_err(|err| map_db_err("commit", err))?;
            metrics().frames_persisted.inc();

            Ok(BulkOutcome {
                metrics_written,
                properties_written,
                versions_written,
            })
        })
        .await
    }

    async fn merge_metrics(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        device_key: i64,
        metrics_in: &[MetricInput],
    ) -> Result<u64> {
        sqlx::query(
            "CREATE TEMPORARY TABLE _stage_metrics \
             (name TEXT NOT NULL, uns_path TEXT NOT NULL, datatype TEXT NOT NULL) \
             ON COMMIT DROP",
        )
        .execute(&mut **tx)
        .await
        .map_err(|err| map_db_err("_stage_metrics", err))?;

        for chunk in metrics_in.chunks(CHUNK) {
            let names: Vec<&str> = chunk.iter().map(|m| m.name.as_str()).collect();
            let paths: Vec<&str> = chunk.iter().map(|m| m.uns_path.as_str()).collect();
            let datatypes: Vec<&str> = chunk.iter().map(|m| m.datatype.as_str()).collect();
            sqlx::query(
                "INSERT INTO _stage_metrics (name, uns_path, datatype) \
                 SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[])",
            )
            .bind(&names)
            .bind(&paths)
            .bind(&datatypes)
            .execute(&mut **tx)
            .await
            .map_err(|err| map_db_err("_stage_metrics", err))?;
        }

        let merged = sqlx::query(&format!(
            "INSERT INTO {schema}.metrics (device_key, name, uns_path, datatype) \
             SELECT $1, s.name, s.uns_path, s.datatype FROM _stage_metrics s \
             ON CONFLICT (device_key, name) DO UPDATE SET \
             uns_path = EXCLUDED.uns_path, datatype = EXCLUDED.datatype \
             WHERE ({schema}.metrics.uns_path, {schema}.metrics.datatype) \
             IS DISTINCT FROM (EXCLUDED.uns_path, EXCLUDED.datatype)",
            schema = self.schema()
        ))
        .bind(device_key)
        .execute(&mut **tx)
        .await
        .map_err(|err| map_db_err("metrics bulk merge", err))?;

        Ok(merged.rows_affected())
    }

    async fn metric_id_map(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        device_key: i64,
        metrics_in: &[MetricInput],
    ) -> Result<HashMap<String, i64>> {
        let mut id_map = HashMap::with_capacity(metrics_in.len());
        for chunk in metrics_in.chunks(CHUNK) {
            let names: Vec<&str> = chunk.iter().map(|m| m.name.as_str()).collect();
            let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
                "SELECT name, metric_key FROM {}.metrics \
                 WHERE device_key = $1 AND name = ANY($2)",
                self.schema()
            ))
            .bind(device_key)
            .bind(&names)
            .fetch_all(&mut **tx)
            .await
            .map_err(|err| map_db_err("metric id map", err))?;
            id_map.extend(rows);
        }
        Ok(id_map)
    }

    async fn merge_properties(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id_map: &HashMap<String, i64>,
        metrics_in: &[MetricInput],
    ) -> Result<u64> {
        sqlx::query(
            "CREATE TEMPORARY TABLE _stage_properties (\
             metric_key BIGINT NOT NULL, key TEXT NOT NULL, type TEXT NOT NULL, \
             value_int INTEGER, value_long BIGINT, value_float REAL, \
             value_double DOUBLE PRECISION, value_string TEXT, value_bool BOOLEAN) \
             ON COMMIT DROP",
        )
        .execute(&mut **tx)
        .await
        .map_err(|err| map_db_err("_stage_properties", err))?;

        // Flatten (metric, key, value) triples, dropping metrics the merge
        // could not place (should not happen; the id map covers every name).
        let mut rows: Vec<(i64, &str, &sync_core::PropertyValue)> = Vec::new();
        for metric in metrics_in {
            let Some(metric_key) = id_map.get(&metric.name) else {
                continue;
            };
            for (key, value) in &metric.properties {
                rows.push((*metric_key, key.as_str(), value));
            }
        }

        for chunk in rows.chunks(CHUNK) {
            let mut keys = Vec::with_capacity(chunk.len());
            let mut prop_keys = Vec::with_capacity(chunk.len());
            let mut types = Vec::with_capacity(chunk.len());
            let mut v_int = Vec::with_capacity(chunk.len());
            let mut v_long = Vec::with_capacity(chunk.len());
            let mut v_float = Vec::with_capacity(chunk.len());
            let mut v_double = Vec::with_capacity(chunk.len());
            let mut v_string = Vec::with_capacity(chunk.len());
            let mut v_bool = Vec::with_capacity(chunk.len());
            for (metric_key, key, value) in chunk {
                let (ci, cl, cf, cd, cs, cb) = property_columns(value);
                keys.push(*metric_key);
                prop_keys.push(*key);
                types.push(value.property_type().as_str());
                v_int.push(ci);
                v_long.push(cl);
                v_float.push(cf);
                v_double.push(cd);
                v_string.push(cs);
                v_bool.push(cb);
            }
            sqlx::query(
                "INSERT INTO _stage_properties \
                 (metric_key, key, type, value_int, value_long, value_float, \
                 value_double, value_string, value_bool) \
                 SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::text[], $4::integer[], \
                 $5::bigint[], $6::real[], $7::double precision[], $8::text[], $9::boolean[])",
            )
            .bind(&keys)
            .bind(&prop_keys)
            .bind(&types)
            .bind(&v_int)
            .bind(&v_long)
            .bind(&v_float)
            .bind(&v_double)
            .bind(&v_string)
            .bind(&v_bool)
            .execute(&mut **tx)
            .await
            .map_err(|err| map_db_err("_stage_properties", err))?;
        }

        let merged = sqlx::query(&format!(
            "INSERT INTO {schema}.metric_properties AS mp \
             (metric_key, key, type, value_int, value_long, value_float, \
             value_double, value_string, value_bool) \
             SELECT metric_key, key, type, value_int, value_long, value_float, \
             value_double, value_string, value_bool FROM _stage_properties \
             ON CONFLICT (metric_key, key) DO UPDATE SET \
             type = EXCLUDED.type, value_int = EXCLUDED.value_int, \
             value_long = EXCLUDED.value_long, value_float = EXCLUDED.value_float, \
             value_double = EXCLUDED.value_double, value_string = EXCLUDED.value_string, \
             value_bool = EXCLUDED.value_bool \
             WHERE (mp.type, mp.value_int, mp.value_long, mp.value_float, mp.value_double, \
             mp.value_string, mp.value_bool) IS DISTINCT FROM \
             (EXCLUDED.type, EXCLUDED.value_int, EXCLUDED.value_long, EXCLUDED.value_float, \
             EXCLUDED.value_double, EXCLUDED.value_string, EXCLUDED.value_bool)",
            schema = self.schema()
        ))
        .execute(&mut **tx)
        .await
        .map_err(|err| map_db_err("properties bulk merge", err))?;

        Ok(merged.rows_affected())
    }

    /// One version row per inserted metric, in the same transaction, so the
    /// CDC listener sees a diff for every first-sighted metric exactly as
    /// it would on the per-row path.
    async fn merge_versions(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id_map: &HashMap<String, i64>,
        metrics_in: &[MetricInput],
    ) -> Result<u64> {
        let mut total = 0u64;
        for chunk in metrics_in.chunks(CHUNK) {
            let mut keys = Vec::with_capacity(chunk.len());
            let mut diffs = Vec::with_capacity(chunk.len());
            for metric in chunk {
                let Some(metric_key) = id_map.get(&metric.name) else {
                    continue;
                };
                keys.push(*metric_key);
                diffs.push(insert_diff(metric));
            }
            if keys.is_empty() {
                continue;
            }
            let inserted = sqlx::query(&format!(
                "INSERT INTO {}.metric_versions (metric_key, changed_by, diff) \
                 SELECT v.metric_key, $3, v.diff \
                 FROM UNNEST($1::bigint[], $2::jsonb[]) AS v(metric_key, diff)",
                self.schema()
            ))
            .bind(&keys)
            .bind(&diffs)
            .bind(CHANGED_BY)
            .execute(&mut **tx)
            .await
            .map_err(|err| map_db_err("versions bulk insert", err))?;
            total += inserted.rows_affected();
        }
        Ok(total)
    }
}
