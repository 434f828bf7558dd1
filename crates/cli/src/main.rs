//! docmig - operator tool for migration history and the migration lock

use anyhow::{Context, Result};
use clap::Parser;
use doc_store::PostgresDocumentStore;
use migrator::Migrator;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod commands;

use cli::{Cli, Commands};
use commands::{history, status, unlock};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli.global.config();
    tracing::debug!(database = ?config.database, "connecting");
    let migrator = Migrator::<PostgresDocumentStore>::connect(config)
        .await
        .context("failed to connect to the document store")?;

    match &cli.command {
        Commands::Status => status::execute(&migrator).await,
        Commands::Unlock => unlock::execute(&migrator).await,
        Commands::History(args) => history::execute(args, &migrator).await,
    }
}
