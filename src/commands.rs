//! Operator commands: migrations, dead-letter replay, fixture ingest.
//!
//! Every command prints a machine-readable JSON summary on stdout and exits
//! non-zero on failure.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use canary::{
    DatasetResolver, Delivery, EgressClient, HttpBatchSender, HttpNamespaceBrowser,
    SessionManager, WriteBatch,
};
use metadata_db::{DbMode, DeadLetterStore, FrameIngestor, JsonlSink, MetadataRepository,
    MigrationRunner,
};

use crate::config::AppConfig;
use crate::fixture::load_fixture;

/// `migrate apply [--dry-run] [--target <version>]`
pub async fn migrate_apply(config: &AppConfig, dry_run: bool, target: Option<i32>) -> Result<()> {
    let pool = metadata_db::connect(&config.db).await?;
    let runner = MigrationRunner::new(pool);
    let summaries = runner.apply(dry_run, target).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "command": "migrate-apply",
            "dry_run": dry_run,
            "target": target,
            "migrations": summaries,
        }))?
    );
    Ok(())
}

/// `migrate rollback [--dry-run]`
pub async fn migrate_rollback(config: &AppConfig, dry_run: bool) -> Result<()> {
    let pool = metadata_db::connect(&config.db).await?;
    let runner = MigrationRunner::new(pool);
    let summary = runner.rollback(dry_run).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "command": "migrate-rollback",
            "dry_run": dry_run,
            "rolled_back": summary,
        }))?
    );
    Ok(())
}

/// `replay-dlq [--limit N] [--execute]`
///
/// Reads pending dead-letter rows oldest-first and re-enters them at the
/// egress client. Without `--execute` the rows are only listed.
pub async fn replay_dlq(config: &AppConfig, limit: i64, execute: bool) -> Result<()> {
    let pool = metadata_db::connect(&config.db).await?;
    let store = DeadLetterStore::new(
        pool,
        &config.db.schema,
        config.dlq.ttl_seconds,
        config.dlq.alert_threshold,
    );
    let rows = store.fetch_pending(limit).await?;

    if !execute {
        let listing: Vec<_> = rows
            .iter()
            .map(|row| {
                json!({
                    "id": row.id,
                    "error_kind": row.error_kind,
                    "attempts": row.attempts,
                    "first_failed_at": row.first_failed_at,
                    "expires_at": row.expires_at,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "command": "replay-dlq",
                "execute": false,
                "pending": listing,
            }))?
        );
        return Ok(());
    }

    // Replay sends through the real egress path but without a dead-letter
    // sink: a failed replay increments the existing row instead of minting
    // a duplicate.
    let session = Arc::new(SessionManager::new(config.egress.clone()).context("egress session")?);
    let browse_http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs_f64(
            config.egress.request_timeout_seconds,
        ))
        .build()?;
    let resolver = Arc::new(DatasetResolver::new(
        Box::new(HttpNamespaceBrowser::new(&config.egress, browse_http)),
        &config.egress,
    ));
    let sender = Arc::new(HttpBatchSender::new(&config.egress)?);
    let client = EgressClient::new(&config.egress, session, resolver, sender, None, None);

    let mut replayed = 0u64;
    let mut failed = 0u64;
    for row in &rows {
        let Some(properties) = row.payload.get("properties").cloned() else {
            store.record_attempt(row.id).await?;
            failed += 1;
            continue;
        };
        let idempotency_key = row
            .payload
            .get("idempotencyKey")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("{:08x}", crc32fast::hash(properties.to_string().as_bytes()))
            });
        let batch = WriteBatch {
            properties,
            idempotency_key,
            lsns: Vec::new(),
            diffs: Vec::new(),
        };
        match client.deliver(batch).await {
            Delivery::Delivered => {
                store.mark_replayed(row.id).await?;
                replayed += 1;
                info!(id = row.id, "dead-letter row replayed");
            }
            Delivery::DeadLettered => {
                store.record_attempt(row.id).await?;
                failed += 1;
            }
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "command": "replay-dlq",
            "execute": true,
            "examined": rows.len(),
            "replayed": replayed,
            "failed": failed,
        }))?
    );
    Ok(())
}

/// `ingest-fixture --path <file>`
pub async fn ingest_fixture(config: &AppConfig, path: &Path) -> Result<()> {
    let frames = load_fixture(path)?;

    let repository = match config.db_mode {
        DbMode::Local => {
            let pool = metadata_db::connect(&config.db).await?;
            Some(MetadataRepository::new(pool, &config.db.schema))
        }
        DbMode::Mock => None,
    };
    let journal = (config.write_jsonl || config.db_mode == DbMode::Mock)
        .then(|| JsonlSink::new(&config.jsonl_pattern));
    let ingestor = FrameIngestor::new(
        config.db_mode,
        repository,
        journal,
        config.db.bulk_threshold,
    );

    let mut reports = Vec::with_capacity(frames.len());
    for frame in &frames {
        reports.push(ingestor.ingest(frame).await?);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "command": "ingest-fixture",
            "path": path.display().to_string(),
            "frames": frames.len(),
            "reports": reports,
        }))?
    );
    Ok(())
}
