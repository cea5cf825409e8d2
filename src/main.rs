//! UNS Metadata Sync
//!
//! Metadata synchronization pipeline for an industrial Unified Namespace:
//! - Sparkplug B birth ingestion with alias resolution over MQTT
//! - canonical device/metric/property model in Postgres
//! - change-data-capture with per-metric debounce
//! - property-only delta egress to the Canary historian write API

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use telemetry::init_tracing_from_env;

mod commands;
mod config;
mod fixture;
mod service;

#[derive(Parser)]
#[command(name = "uns-metadata-sync", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the sync service (default when no subcommand is given).
    Run,
    /// Apply or roll back schema migrations.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Replay pending dead-letter rows through the egress client.
    ReplayDlq {
        /// Maximum rows to examine
        #[arg(long)]
        limit: Option<i64>,
        /// Actually resend; without this the rows are only listed
        #[arg(long)]
        execute: bool,
    },
    /// Ingest a fixture file through the persistence pipeline.
    IngestFixture {
        /// Fixture file holding one frame or an array of frames
        #[arg(long)]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Apply pending migrations.
    Apply {
        /// Print the plan without executing
        #[arg(long)]
        dry_run: bool,
        /// Stop after this version
        #[arg(long)]
        target: Option<i32>,
    },
    /// Roll back the most recently applied migration.
    Rollback {
        /// Print the plan without executing
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23+ requires explicit crypto provider selection before any
    // TLS usage (broker and historian connections).
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    dotenvy::dotenv().ok();
    init_tracing_from_env();

    let cli = Cli::parse();
    let config = config::load_config()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => service::run(config).await,
        Command::Migrate { action } => match action {
            MigrateAction::Apply { dry_run, target } => {
                commands::migrate_apply(&config, dry_run, target).await
            }
            MigrateAction::Rollback { dry_run } => {
                commands::migrate_rollback(&config, dry_run).await
            }
        },
        Command::ReplayDlq { limit, execute } => {
            let limit = limit.unwrap_or(config.dlq.replay_batch_size);
            commands::replay_dlq(&config, limit, execute).await
        }
        Command::IngestFixture { path } => commands::ingest_fixture(&config, &path).await,
    }
}
