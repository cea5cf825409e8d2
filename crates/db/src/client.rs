//! Postgres pool construction and shared error/retry helpers.

use std::future::Future;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use sync_core::{Error, Result};
use telemetry::metrics;
use tracing::warn;

use crate::config::DbConfig;

/// Bounded retry policy for transient store failures.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Create the application connection pool.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    if config.conninfo.is_empty() {
        return Err(Error::config("db.conninfo is not configured"));
    }
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.conninfo)
        .await
        .map_err(|err| Error::transient(format!("database connection failed: {err}")))
}

/// Map a sqlx error onto the pipeline taxonomy.
///
/// Uniqueness/check/foreign-key violations carry the offending natural key;
/// connection-shaped failures surface as transient so the retry policy can
/// take them.
pub(crate) fn map_db_err(key: &str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            if matches!(code.as_str(), "23505" | "23514" | "23503") {
                metrics().constraint_violations.inc();
                Error::constraint(key.to_string(), db_err.to_string())
            } else {
                Error::internal(format!("database error on {key}: {db_err}"))
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            Error::transient(format!("database unavailable during {key}: {err}"))
        }
        _ => Error::internal(format!("database error on {key}: {err}")),
    }
}

/// Run `op` with bounded exponential backoff on transient failures.
///
/// Constraint violations and other terminal errors surface immediately; the
/// operations passed here are idempotent so a mid-flight retry is safe.
pub(crate) async fn with_retries<T, F, Fut>(context: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE;
    for attempt in 0..=RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < RETRY_ATTEMPTS => {
                metrics().db_retries.inc();
                warn!(
                    context = %context,
                    attempt = attempt + 1,
                    delay_ms = %delay.as_millis(),
                    error = %err,
                    "transient database error; retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop returns on final attempt")
}
