//! Dead-letter store for egress payloads that exhausted retries or were
//! classified as non-retriable.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sync_core::Result;
use telemetry::metrics;
use tracing::warn;

use crate::client::{map_db_err, with_retries};

/// Row status lifecycle: `pending` rows are replayable, `replayed` rows
/// succeeded on a later attempt, `expired` rows aged past their TTL.
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_REPLAYED: &str = "replayed";
pub const STATUS_EXPIRED: &str = "expired";

/// A dead-lettered payload awaiting operator action.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DlqRow {
    pub id: i64,
    pub payload: serde_json::Value,
    pub error_kind: String,
    pub error_detail: Option<String>,
    pub attempts: i32,
    pub first_failed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: String,
}

/// Durable dead-letter table with TTL and operator-driven replay.
#[derive(Clone)]
pub struct DeadLetterStore {
    pool: PgPool,
    schema: String,
    ttl: Duration,
    alert_threshold: u64,
}

impl DeadLetterStore {
    pub fn new(pool: PgPool, schema: impl Into<String>, ttl_seconds: i64, alert_threshold: u64) -> Self {
        Self {
            pool,
            schema: schema.into(),
            ttl: Duration::seconds(ttl_seconds),
            alert_threshold,
        }
    }

    /// Record an unrecoverable egress failure.
    pub async fn insert(
        &self,
        payload: &serde_json::Value,
        kind: &str,
        detail: &str,
        attempts: u32,
    ) -> Result<i64> {
        let expires_at = Utc::now() + self.ttl;
        let id = with_retries("dlq_insert", || async {
            let row: (i64,) = sqlx::query_as(&format!(
                "INSERT INTO {}.canary_dlq (payload, error_kind, error_detail, attempts, expires_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                self.schema
            ))
            .bind(payload)
            .bind(kind)
            .bind(detail)
            .bind(attempts as i32)
            .bind(expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))?;
            Ok(row.0)
        })
        .await?;

        metrics().dead_letters.inc();
        self.refresh_depth().await?;
        Ok(id)
    }

    /// Pending rows oldest-first, bounded for chunked replay.
    pub async fn fetch_pending(&self, limit: i64) -> Result<Vec<DlqRow>> {
        with_retries("dlq_fetch_pending", || async {
            sqlx::query_as::<_, DlqRow>(&format!(
                "SELECT id, payload, error_kind, error_detail, attempts, first_failed_at, \
                 expires_at, status \
                 FROM {}.canary_dlq WHERE status = $1 ORDER BY first_failed_at ASC LIMIT $2",
                self.schema
            ))
            .bind(STATUS_PENDING)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))
        })
        .await
    }

    /// Mark a row successfully re-delivered.
    pub async fn mark_replayed(&self, id: i64) -> Result<()> {
        with_retries("dlq_mark_replayed", || async {
            sqlx::query(&format!(
                "UPDATE {}.canary_dlq SET status = $1 WHERE id = $2",
                self.schema
            ))
            .bind(STATUS_REPLAYED)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))?;
            Ok(())
        })
        .await?;
        self.refresh_depth().await
    }

    /// Count a failed replay attempt against a row.
    pub async fn record_attempt(&self, id: i64) -> Result<()> {
        with_retries("dlq_record_attempt", || async {
            sqlx::query(&format!(
                "UPDATE {}.canary_dlq SET attempts = attempts + 1 WHERE id = $1",
                self.schema
            ))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))?;
            Ok(())
        })
        .await
    }

    /// Expire pending rows past their TTL and drop terminal rows once they
    /// have aged an extra grace period (keeping them inspectable for a
    /// while). Returns (expired, deleted).
    pub async fn purge_expired(&self) -> Result<(u64, u64)> {
        let result = with_retries("dlq_purge", || async {
            let expired = sqlx::query(&format!(
                "UPDATE {}.canary_dlq SET status = $1 \
                 WHERE status = $2 AND expires_at < now()",
                self.schema
            ))
            .bind(STATUS_EXPIRED)
            .bind(STATUS_PENDING)
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))?
            .rows_affected();

            let deleted = sqlx::query(&format!(
                "DELETE FROM {}.canary_dlq \
                 WHERE status IN ($1, $2) AND expires_at < now() - interval '7 days'",
                self.schema
            ))
            .bind(STATUS_REPLAYED)
            .bind(STATUS_EXPIRED)
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))?
            .rows_affected();

            Ok((expired, deleted))
        })
        .await?;

        self.refresh_depth().await?;
        Ok(result)
    }

    /// Pending-row count, also published as the alerting gauge.
    pub async fn pending_count(&self) -> Result<u64> {
        let count: (i64,) = with_retries("dlq_pending_count", || async {
            sqlx::query_as(&format!(
                "SELECT count(*) FROM {}.canary_dlq WHERE status = $1",
                self.schema
            ))
            .bind(STATUS_PENDING)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_db_err("canary_dlq", err))
        })
        .await?;
        Ok(count.0 as u64)
    }

    async fn refresh_depth(&self) -> Result<()> {
        let depth = self.pending_count().await?;
        metrics().dlq_depth.set(depth);
        if depth >= self.alert_threshold {
            warn!(
                depth = depth,
                threshold = self.alert_threshold,
                "dead-letter queue depth above alert threshold"
            );
        }
        Ok(())
    }
}
