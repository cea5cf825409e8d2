//! Service wiring: long-lived tasks joined under one cancellation tree.
//!
//! Tasks communicate exclusively through bounded channels: MQTT intake →
//! ingest pipeline → store; CDC stream → debounce → egress queue → historian.
//! Shutdown cancels the tree, drains what each stage already holds, and
//! flushes persistent state (alias cache, resume token, egress residue).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use canary::{
    DatasetResolver, EgressClient, EgressQueue, HttpBatchSender, HttpNamespaceBrowser, OnSettled,
    SessionManager,
};
use cdc::{
    AggregatedDiff, CdcListener, CheckpointBackend, CheckpointGate, CheckpointStore, DiffSink,
    FileCheckpointStore, InMemoryCheckpointStore, PgMetadataProvider, SqlChangeStream,
};
use metadata_db::{DbMode, DeadLetterStore, FrameIngestor, JsonlSink, MetadataRepository};
use sparkplug::{AliasCache, Subscriber};
use sync_core::Result as CoreResult;
use telemetry::health;

use crate::config::AppConfig;

/// Bridges the egress client's dead-letter sink onto the durable store.
struct DlqSinkAdapter(Arc<DeadLetterStore>);

#[async_trait]
impl canary::DeadLetterSink for DlqSinkAdapter {
    async fn record(
        &self,
        payload: &serde_json::Value,
        kind: &str,
        detail: &str,
        attempts: u32,
    ) -> CoreResult<()> {
        self.0.insert(payload, kind, detail, attempts).await.map(|_| ())
    }
}

/// Diff sink used when egress is disabled: journal the diff and settle its
/// position immediately.
struct JournalDiffSink {
    sink: JsonlSink,
    gate: Arc<CheckpointGate>,
}

#[async_trait]
impl DiffSink for JournalDiffSink {
    async fn emit(&self, diff: AggregatedDiff) -> CoreResult<()> {
        let lsn = diff.max_lsn;
        self.sink.append("cdc_diff", &serde_json::to_value(&diff)?)?;
        self.gate.confirm(lsn);
        Ok(())
    }
}

/// Run the full pipeline until a shutdown signal arrives.
pub async fn run(config: AppConfig) -> Result<()> {
    info!(
        db_mode = ?config.db_mode,
        cdc = config.cdc.enabled,
        egress = config.egress.enabled,
        "starting uns-metadata-sync v{}",
        env!("CARGO_PKG_VERSION")
    );

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ---------------------------------------------------------------- store
    let pool = match config.db_mode {
        DbMode::Local => {
            let pool = metadata_db::connect(&config.db)
                .await
                .context("database connection failed at startup")?;
            health().database.set_healthy();
            Some(pool)
        }
        DbMode::Mock => {
            info!("db_mode=mock: repository writes fall back to the local sink");
            // No store dependency to report on.
            health().database.set_healthy();
            None
        }
    };
    let repository = pool
        .clone()
        .map(|pool| MetadataRepository::new(pool, &config.db.schema));
    let journal = (config.write_jsonl || config.db_mode == DbMode::Mock)
        .then(|| JsonlSink::new(&config.jsonl_pattern));

    let dlq_store = pool.clone().map(|pool| {
        Arc::new(DeadLetterStore::new(
            pool,
            &config.db.schema,
            config.dlq.ttl_seconds,
            config.dlq.alert_threshold,
        ))
    });

    // ---------------------------------------------------------------- intake
    let alias_cache = Arc::new(AliasCache::load(&config.broker.alias_cache_path));
    let (frame_tx, frame_rx) = mpsc::channel(config.broker.channel_capacity);

    let subscriber = Subscriber::new(
        config.broker.clone(),
        Arc::clone(&alias_cache),
        frame_tx,
        cancel.clone(),
    );
    tasks.push(tokio::spawn(async move {
        if let Err(err) = subscriber.run().await {
            error!(error = %err, "sparkplug subscriber exited with error");
        }
    }));

    let ingestor = FrameIngestor::new(
        config.db_mode,
        repository.clone(),
        journal.clone(),
        config.db.bulk_threshold,
    );
    let ingest_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(err) = ingestor.run(frame_rx, ingest_cancel).await {
            error!(error = %err, "frame ingestor exited with error");
        }
    }));

    // ---------------------------------------------------------------- egress
    let gate = Arc::new(CheckpointGate::new());
    let on_settled: OnSettled = {
        let gate = Arc::clone(&gate);
        Arc::new(move |lsn| gate.confirm(lsn))
    };

    let egress_configured = config.egress.enabled
        && !config.egress.base_url.is_empty()
        && !config.egress.api_token.is_empty();

    let diff_sink: Arc<dyn DiffSink> = if egress_configured {
        let session = Arc::new(
            SessionManager::new(config.egress.clone()).context("egress session manager")?,
        );
        let browse_http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.egress.request_timeout_seconds))
            .build()
            .context("egress browse client")?;
        let resolver = Arc::new(DatasetResolver::new(
            Box::new(HttpNamespaceBrowser::new(&config.egress, browse_http)),
            &config.egress,
        ));
        let sender = Arc::new(HttpBatchSender::new(&config.egress).context("egress sender")?);
        let dlq_sink: Option<Arc<dyn canary::DeadLetterSink>> = dlq_store
            .clone()
            .map(|store| Arc::new(DlqSinkAdapter(store)) as Arc<dyn canary::DeadLetterSink>);

        let client = Arc::new(EgressClient::new(
            &config.egress,
            session.clone(),
            resolver,
            sender,
            dlq_sink.clone(),
            Some(Arc::clone(&on_settled)),
        ));

        let (diff_tx, diff_rx) = mpsc::channel(config.egress.queue_capacity);
        let egress_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            client.run(diff_rx, egress_cancel).await;
        }));

        // Keepalive timer: lazy keepalives fire when the session sits idle.
        let keepalive_session = Arc::clone(&session);
        let keepalive_cancel = cancel.clone();
        let keepalive_period =
            Duration::from_secs((config.egress.keepalive_idle_seconds / 2).max(1));
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = keepalive_cancel.cancelled() => break,
                    _ = tokio::time::sleep(keepalive_period) => {
                        keepalive_session.tick().await;
                    }
                }
            }
            keepalive_session.shutdown().await;
        }));

        health().canary.set_healthy();
        Arc::new(EgressQueue::new(
            diff_tx,
            config.egress.queue_policy,
            dlq_sink,
            Some(on_settled),
        ))
    } else {
        info!("egress disabled; aggregated diffs journal locally");
        health().canary.set_healthy();
        Arc::new(JournalDiffSink {
            sink: JsonlSink::new(&config.jsonl_pattern),
            gate: Arc::clone(&gate),
        })
    };

    // ---------------------------------------------------------------- cdc
    if config.cdc.enabled {
        if let Some(pool) = pool.clone() {
            let stream = SqlChangeStream::new(
                pool.clone(),
                &config.db.slot_name,
                &config.db.publication_name,
            );
            stream
                .ensure_slot()
                .await
                .context("replication slot setup failed at startup")?;

            let provider = Arc::new(PgMetadataProvider::new(pool, &config.db.schema));
            let store: Arc<dyn CheckpointStore> = match config.cdc.checkpoint_backend {
                CheckpointBackend::File => Arc::new(FileCheckpointStore::open(
                    &config.cdc.resume_path,
                    config.cdc.resume_fsync,
                )),
                CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStore::new()),
            };

            let mut listener = CdcListener::new(
                stream,
                provider,
                Arc::clone(&diff_sink),
                store,
                Arc::clone(&gate),
                config.cdc.clone(),
                &config.db.slot_name,
            );
            let cdc_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = listener.run(cdc_cancel).await {
                    error!(error = %err, "cdc listener exited with error");
                }
            }));
        } else {
            info!("cdc listener requires db_mode=local; skipping");
            health().cdc.set_healthy();
        }
    } else {
        health().cdc.set_healthy();
    }

    // ---------------------------------------------------------------- dlq purge
    if let Some(store) = dlq_store {
        let purge_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = purge_cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        match store.purge_expired().await {
                            Ok((expired, deleted)) if expired + deleted > 0 => {
                                info!(expired, deleted, "dead-letter purge completed");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "dead-letter purge failed"),
                        }
                    }
                }
            }
        }));
    }

    // ---------------------------------------------------------------- health server
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid health listener address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind health listener")?;
    info!(addr = %addr, "health endpoints listening");

    axum::serve(listener, api::router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("health server error")?;

    info!("shutdown signal received; draining pipeline");
    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "task join failed during shutdown");
        }
    }
    if let Err(err) = alias_cache.snapshot() {
        warn!(error = %err, "final alias cache snapshot failed");
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
