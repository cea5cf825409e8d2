//! Embedded schema migrations with a version/checksum ledger.
//!
//! Each migration applies inside its own transaction. The ledger records the
//! checksum of the applied SQL and refuses to re-run a version whose text
//! changed after the fact.

use serde::Serialize;
use sqlx::PgPool;
use sync_core::{Error, Result};
use tracing::info;

use crate::client::map_db_err;

/// One ordered schema migration with its paired down script.
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        format!("{:08x}", crc32fast::hash(self.up.as_bytes()))
    }
}

/// Summary line emitted for each planned or applied migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub version: i32,
    pub name: String,
    pub checksum: String,
    pub applied: bool,
}

const UP_INIT: &str = r#"
CREATE SCHEMA IF NOT EXISTS uns_meta;

CREATE TABLE uns_meta.devices (
    device_key      BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    group_id        TEXT NOT NULL,
    country         TEXT NOT NULL,
    business_unit   TEXT NOT NULL,
    plant           TEXT NOT NULL,
    edge            TEXT NOT NULL,
    device          TEXT NOT NULL,
    uns_path        TEXT NOT NULL UNIQUE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (group_id, edge, device)
);

CREATE TABLE uns_meta.metrics (
    metric_key      BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    device_key      BIGINT NOT NULL REFERENCES uns_meta.devices(device_key),
    name            TEXT NOT NULL,
    uns_path        TEXT NOT NULL UNIQUE,
    canary_id       TEXT NOT NULL GENERATED ALWAYS AS (replace(uns_path, '/', '.')) STORED,
    datatype        TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (device_key, name)
);

CREATE TABLE uns_meta.metric_properties (
    metric_key      BIGINT NOT NULL REFERENCES uns_meta.metrics(metric_key) ON DELETE CASCADE,
    key             TEXT NOT NULL,
    type            TEXT NOT NULL
                    CHECK (type IN ('int', 'long', 'float', 'double', 'string', 'boolean')),
    value_int       INTEGER,
    value_long      BIGINT,
    value_float     REAL,
    value_double    DOUBLE PRECISION,
    value_string    TEXT,
    value_bool      BOOLEAN,
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (metric_key, key),
    CHECK (
        num_nonnulls(value_int, value_long, value_float, value_double,
                     value_string, value_bool) = 1
        AND ((type = 'int'     AND value_int    IS NOT NULL)
          OR (type = 'long'    AND value_long   IS NOT NULL)
          OR (type = 'float'   AND value_float  IS NOT NULL)
          OR (type = 'double'  AND value_double IS NOT NULL)
          OR (type = 'string'  AND value_string IS NOT NULL)
          OR (type = 'boolean' AND value_bool   IS NOT NULL))
    )
);

CREATE TABLE uns_meta.metric_versions (
    version_id      BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    metric_key      BIGINT NOT NULL REFERENCES uns_meta.metrics(metric_key) ON DELETE CASCADE,
    changed_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    changed_by      TEXT NOT NULL,
    diff            JSONB NOT NULL
);

CREATE TABLE uns_meta.metric_path_lineage (
    lineage_id      BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    metric_key      BIGINT NOT NULL REFERENCES uns_meta.metrics(metric_key) ON DELETE CASCADE,
    old_uns_path    TEXT NOT NULL,
    new_uns_path    TEXT NOT NULL,
    changed_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (metric_key, old_uns_path, new_uns_path)
);

CREATE TABLE uns_meta.canary_dlq (
    id              BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    payload         JSONB NOT NULL,
    error_kind      TEXT NOT NULL,
    error_detail    TEXT,
    attempts        INTEGER NOT NULL DEFAULT 0,
    first_failed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    expires_at      TIMESTAMPTZ NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'replayed', 'expired'))
);

CREATE INDEX idx_canary_dlq_pending
    ON uns_meta.canary_dlq (first_failed_at) WHERE status = 'pending';

CREATE FUNCTION uns_meta.touch_updated_at() RETURNS trigger AS $$
BEGIN
    NEW.updated_at = now();
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER devices_touch_updated_at
    BEFORE UPDATE ON uns_meta.devices
    FOR EACH ROW EXECUTE FUNCTION uns_meta.touch_updated_at();
CREATE TRIGGER metrics_touch_updated_at
    BEFORE UPDATE ON uns_meta.metrics
    FOR EACH ROW EXECUTE FUNCTION uns_meta.touch_updated_at();
CREATE TRIGGER metric_properties_touch_updated_at
    BEFORE UPDATE ON uns_meta.metric_properties
    FOR EACH ROW EXECUTE FUNCTION uns_meta.touch_updated_at();
"#;

const DOWN_INIT: &str = r#"
DROP TABLE IF EXISTS uns_meta.canary_dlq;
DROP TABLE IF EXISTS uns_meta.metric_path_lineage;
DROP TABLE IF EXISTS uns_meta.metric_versions;
DROP TABLE IF EXISTS uns_meta.metric_properties;
DROP TABLE IF EXISTS uns_meta.metrics;
DROP TABLE IF EXISTS uns_meta.devices;
DROP FUNCTION IF EXISTS uns_meta.touch_updated_at();
"#;

const UP_PUBLICATION: &str = r#"
DO $$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM pg_publication WHERE pubname = 'uns_meta_pub') THEN
        CREATE PUBLICATION uns_meta_pub
            FOR TABLE uns_meta.metrics, uns_meta.metric_properties;
    END IF;
END
$$;
"#;

const DOWN_PUBLICATION: &str = r#"
DROP PUBLICATION IF EXISTS uns_meta_pub;
"#;

/// All migrations in apply order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "init_metadata_schema",
        up: UP_INIT,
        down: DOWN_INIT,
    },
    Migration {
        version: 2,
        name: "create_cdc_publication",
        up: UP_PUBLICATION,
        down: DOWN_PUBLICATION,
    },
];

/// Applies and rolls back embedded migrations against a pool.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_ledger(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE SCHEMA IF NOT EXISTS uns_meta;
             CREATE TABLE IF NOT EXISTS uns_meta.schema_migrations (
                 version    INTEGER PRIMARY KEY,
                 name       TEXT NOT NULL,
                 checksum   TEXT NOT NULL,
                 applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| map_db_err("schema_migrations", err))?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<(i32, String)>> {
        sqlx::query_as::<_, (i32, String)>(
            "SELECT version, checksum FROM uns_meta.schema_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| map_db_err("schema_migrations", err))
    }

    /// Apply pending migrations up to `target` (all when `None`).
    ///
    /// With `dry_run` the plan is returned without executing anything.
    pub async fn apply(
        &self,
        dry_run: bool,
        target: Option<i32>,
    ) -> Result<Vec<MigrationSummary>> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;

        let mut summaries = Vec::new();
        for migration in MIGRATIONS {
            if let Some(target) = target {
                if migration.version > target {
                    break;
                }
            }
            let checksum = migration.checksum();
            if let Some((_, recorded)) = applied
                .iter()
                .find(|(version, _)| *version == migration.version)
            {
                if recorded != &checksum {
                    return Err(Error::config(format!(
                        "migration {} checksum mismatch: ledger has {recorded}, \
                         embedded SQL hashes to {checksum}",
                        migration.version
                    )));
                }
                continue;
            }

            if !dry_run {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|err| map_db_err("begin", err))?;
                sqlx::raw_sql(migration.up)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| map_db_err(migration.name, err))?;
                sqlx::query(
                    "INSERT INTO uns_meta.schema_migrations (version, name, checksum) \
                     VALUES ($1, $2, $3)",
                )
                .bind(migration.version)
                .bind(migration.name)
                .bind(&checksum)
                .execute(&mut *tx)
                .await
                .map_err(|err| map_db_err(migration.name, err))?;
                tx.commit().await.map_err(|err| map_db_err("commit", err))?;
                info!(version = migration.version, name = migration.name, "migration applied");
            }

            summaries.push(MigrationSummary {
                version: migration.version,
                name: migration.name.to_string(),
                checksum,
                applied: !dry_run,
            });
        }
        Ok(summaries)
    }

    /// Roll back the most recently applied migration.
    pub async fn rollback(&self, dry_run: bool) -> Result<Option<MigrationSummary>> {
        self.ensure_ledger().await?;
        let applied = self.applied_versions().await?;
        let Some((version, _)) = applied.last() else {
            return Ok(None);
        };
        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == *version)
            .ok_or_else(|| {
                Error::config(format!("no embedded migration for applied version {version}"))
            })?;

        if !dry_run {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| map_db_err("begin", err))?;
            sqlx::raw_sql(migration.down)
                .execute(&mut *tx)
                .await
                .map_err(|err| map_db_err(migration.name, err))?;
            sqlx::query("DELETE FROM uns_meta.schema_migrations WHERE version = $1")
                .bind(migration.version)
                .execute(&mut *tx)
                .await
                .map_err(|err| map_db_err(migration.name, err))?;
            tx.commit().await.map_err(|err| map_db_err("commit", err))?;
            info!(version = migration.version, name = migration.name, "migration rolled back");
        }

        Ok(Some(MigrationSummary {
            version: migration.version,
            name: migration.name.to_string(),
            checksum: migration.checksum(),
            applied: !dry_run,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_unique() {
        let mut last = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > last, "versions must ascend");
            last = migration.version;
        }
    }

    #[test]
    fn checksum_is_stable_per_sql_text() {
        let first = MIGRATIONS[0].checksum();
        assert_eq!(first, MIGRATIONS[0].checksum());
        assert_ne!(first, MIGRATIONS[1].checksum());
        assert_eq!(first.len(), 8);
    }

    #[test]
    fn publication_covers_exactly_metrics_and_properties() {
        assert!(UP_PUBLICATION.contains("uns_meta.metrics, uns_meta.metric_properties"));
        assert!(!UP_PUBLICATION.contains("devices"));
    }
}
