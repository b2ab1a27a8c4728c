//! Concord node binary.
//!
//! Runs the persistence and cross-server sync core as a standalone process,
//! or performs one administrative operation and exits.
//!
//! # Startup Sequence (`run`)
//!
//! 1. Parse the command line
//! 2. Load configuration from `concord.yaml` (defaults if absent)
//! 3. Initialize structured logging (tracing)
//! 4. Connect the pool (degraded mode if the store is unreachable)
//! 5. Start the sync service (migrations, announce, periodic jobs)
//! 6. Wait for Ctrl-C, then shut down gracefully

mod cli;
mod error;

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use concord_core::bus::LoggingSink;
use concord_core::config::{ConcordConfig, LoggingConfig};
use concord_core::service::SyncService;
use concord_db::migrator::pending_migrations;
use concord_db::{MIGRATIONS, Migrator, PgStateStore, PoolManager, StateRepository};
use concord_legacy::{MigrationOutcome, MigrationTool};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::error::NodeError;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration cannot be loaded or an administrative
/// operation fails outright.
#[tokio::main]
async fn main() -> Result<ExitCode, NodeError> {
    let cli = Cli::parse();

    let mut config = ConcordConfig::load_or_default(&cli.config)?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    config.logging.json |= cli.json_logs;
    init_logging(&config.logging);

    info!(
        config = %cli.config.display(),
        server_name = %config.server.name,
        store_enabled = config.store.enabled,
        "concord-node starting"
    );

    match cli.command() {
        Command::Run => run(&config).await,
        Command::MigrateLegacy => migrate_legacy(&config).await,
        Command::ExportLegacy { out } => {
            let pool = connect(&config).await;
            let summary = legacy_tool(&config, &pool).export_to_legacy(&out).await?;
            print_json(&summary)?;
            pool.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Backup { name } => {
            let pool = connect(&config).await;
            let manifest = legacy_tool(&config, &pool).create_backup(&name).await?;
            print_json(&manifest)?;
            pool.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate => {
            let pool = connect(&config).await;
            let report = legacy_tool(&config, &pool).validate().await?;
            print_json(&report)?;
            pool.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Migrations => migrations(&config).await,
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect(config: &ConcordConfig) -> PoolManager {
    if !config.store.enabled {
        return PoolManager::disabled("store disabled in configuration", &config.executor_config());
    }
    PoolManager::connect(&config.pool_config(), &config.executor_config()).await
}

fn legacy_tool(config: &ConcordConfig, pool: &PoolManager) -> MigrationTool {
    let state: Arc<dyn StateRepository> = Arc::new(PgStateStore::new(pool.clone()));
    MigrationTool::new(
        &config.legacy.data_dir,
        &config.legacy.backup_dir,
        state,
        pool.is_enabled(),
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<(), NodeError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(config: &ConcordConfig) -> Result<ExitCode, NodeError> {
    let pool = connect(config).await;
    let service = SyncService::start(config, pool, Arc::new(LoggingSink)).await;
    info!(server_id = %service.server_id(), "Node running, press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    service.shutdown().await;
    signal?;
    Ok(ExitCode::SUCCESS)
}

async fn migrate_legacy(config: &ConcordConfig) -> Result<ExitCode, NodeError> {
    let pool = connect(config).await;
    if let Err(e) = Migrator::new(&pool).run().await {
        tracing::error!(error = %e, "Schema migration failed, legacy import not attempted");
    }

    let outcome = legacy_tool(config, &pool).migrate_all().await;
    pool.close().await;
    match outcome {
        MigrationOutcome::Completed(summary) => {
            print_json(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        MigrationOutcome::Failed { reason } => {
            eprintln!("legacy migration failed: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[derive(Serialize)]
struct LedgerEntry {
    name: String,
    applied_at: Option<String>,
}

async fn migrations(config: &ConcordConfig) -> Result<ExitCode, NodeError> {
    let pool = connect(config).await;
    if !pool.is_enabled() {
        eprintln!(
            "store unavailable: {}",
            pool.disabled_reason().unwrap_or_default()
        );
        return Ok(ExitCode::FAILURE);
    }

    let applied = Migrator::new(&pool).applied().await?;
    let names: HashSet<String> = applied.iter().map(|r| r.name.clone()).collect();
    let mut ledger: Vec<LedgerEntry> = applied
        .into_iter()
        .map(|r| LedgerEntry {
            name: r.name,
            applied_at: Some(r.applied_at.to_rfc3339()),
        })
        .collect();
    ledger.extend(
        pending_migrations(MIGRATIONS, &names)
            .into_iter()
            .map(|m| LedgerEntry {
                name: m.name.to_owned(),
                applied_at: None,
            }),
    );
    print_json(&ledger)?;
    pool.close().await;
    Ok(ExitCode::SUCCESS)
}
