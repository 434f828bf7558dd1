//! CLI argument definitions using clap derive API

use clap::{Args, Parser, Subcommand};
use migrator::MigratorConfig;

/// docmig - inspect and repair migration state in a document store
#[derive(Parser, Debug)]
#[command(name = "docmig")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Connection and collection options shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// PostgreSQL connection string
    #[arg(long, global = true, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Target database (schema) name
    #[arg(short, long, global = true, env = "MIGRATE_DATABASE")]
    pub database: Option<String>,

    /// History collection name
    #[arg(long, global = true, env = "MIGRATE_HISTORY_COLLECTION")]
    pub history_collection: Option<String>,

    /// Lock collection name
    #[arg(long, global = true, env = "MIGRATE_LOCK_COLLECTION")]
    pub lock_collection: Option<String>,
}

impl GlobalArgs {
    /// Builds the migrator configuration: environment first, then flags.
    pub fn config(&self) -> MigratorConfig {
        let mut config = MigratorConfig::from_env();
        if let Some(url) = &self.database_url {
            config = config.with_database_url(url);
        }
        if let Some(database) = &self.database {
            config = config.with_database(database);
        }
        if let Some(name) = &self.history_collection {
            config = config.with_history_collection(name);
        }
        if let Some(name) = &self.lock_collection {
            config = config.with_lock_collection(name);
        }
        config
    }
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the lock state and the number of applied steps per unit
    Status,

    /// Force-release the migration lock left behind by a dead process
    Unlock,

    /// List applied change steps, newest first
    History(HistoryArgs),
}

/// Arguments for the history command
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Only show entries of this migration unit
    #[arg(short, long)]
    pub unit: Option<String>,

    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;
