//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod init;
mod purge;
mod record;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use brute_store::config::{ConfigFile, StoreConfig, UpsertStrategy};
use brute_store::DieselClientStore;

#[derive(Parser)]
#[command(name = "brute-store")]
#[command(about = "Manage the client table used for brute-force protection")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database URL (sqlite path or postgres:// URL)
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema holding the client table (PostgreSQL only, empty for none)
    #[arg(long, global = true)]
    schema: Option<String>,

    /// Client table name
    #[arg(long, global = true)]
    table: Option<String>,

    /// How `set` writes rows
    #[arg(long, global = true, value_enum)]
    upsert: Option<UpsertStrategy>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create the client table and its expiry index
    Init,

    /// Show the record for a client key
    Get {
        /// Client key (usually an IP address)
        key: String,
    },

    /// Write the record for a client key
    Set {
        /// Client key (usually an IP address)
        key: String,
        /// Request count to store
        #[arg(long)]
        count: u64,
        /// Seconds until the record expires (0 or omitted = never)
        #[arg(long)]
        lifetime: Option<u64>,
    },

    /// Record one more request for a client key
    Hit {
        /// Client key (usually an IP address)
        key: String,
        /// Seconds until the record expires (0 or omitted = never)
        #[arg(long)]
        lifetime: Option<u64>,
    },

    /// Delete the record for a client key
    Reset {
        /// Client key (usually an IP address)
        key: String,
    },

    /// Delete all expired records once
    Purge,

    /// Delete expired records periodically until interrupted
    Sweep {
        /// Seconds between passes
        #[arg(short, long, default_value = "60")]
        interval: u64,
    },
}

/// Build the effective store config: defaults < config file < environment < flags.
async fn load_config(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let file = match &cli.config {
        Some(path) => ConfigFile::load_from_path(path).await?,
        None => ConfigFile::load().await,
    };
    let mut config = file.into_store_config();

    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(schema) = &cli.schema {
        config.schema_name = Some(schema.clone()).filter(|s| !s.is_empty());
    }
    if let Some(table) = &cli.table {
        config.table_name = table.clone();
    }
    if let Some(upsert) = cli.upsert {
        config.upsert = upsert;
    }

    config.validate()?;
    Ok(config)
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    let store = DieselClientStore::new(config)?;

    match cli.command {
        Commands::Init => init::cmd_init(&store).await,
        Commands::Get { key } => record::cmd_get(&store, &key).await,
        Commands::Set {
            key,
            count,
            lifetime,
        } => record::cmd_set(&store, &key, count, lifetime).await,
        Commands::Hit { key, lifetime } => record::cmd_hit(&store, &key, lifetime).await,
        Commands::Reset { key } => record::cmd_reset(&store, &key).await,
        Commands::Purge => purge::cmd_purge(&store).await,
        Commands::Sweep { interval } => purge::cmd_sweep(store, interval).await,
    }
}
