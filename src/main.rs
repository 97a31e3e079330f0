//! # Commerce Connectors Entry Point
//!
//! `serve` (the default) runs the API and the sync scheduler; `migrate` applies pending
//! migrations; `sync` runs one backfill in the foreground and prints its report.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commerce_connectors::{
    config::ConfigLoader,
    db,
    server::{AppState, run_server},
    telemetry,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "commerce-connectors", version, about = "Shopify and Stripe metric connectors")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and the background scheduler
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Backfill one connection now and print the report as JSON
    Sync {
        connection_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing tracing")?;
    telemetry::describe_metrics();
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(profile = %config.profile, config = %redacted, "configuration loaded");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await.context("running migrations")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config, db).await,
        Command::Migrate => {
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::Sync { connection_id } => {
            let state = AppState::build(config, db)?;
            let report = state
                .orchestrator
                .sync_connection(connection_id)
                .await
                .with_context(|| format!("syncing connection {connection_id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
