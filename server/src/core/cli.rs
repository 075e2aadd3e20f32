use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::config::StoreBackend;

fn parse_store_backend(s: &str) -> Result<StoreBackend, String> {
    match s.to_lowercase().as_str() {
        "sqlite" => Ok(StoreBackend::Sqlite),
        "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
        _ => Err(format!(
            "Invalid store backend '{}'. Valid options: sqlite, postgres",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "pubhub")]
#[command(version, about = "PubSubHubbub-style hub", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server host address
    #[arg(long, short = 'H', global = true, env = "HUB_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', global = true, env = "HUB_PORT")]
    pub port: Option<u16>,

    /// Relax the callback/topic port allowlist and the work-endpoint auth
    /// check for local development.
    #[arg(long, global = true, env = "HUB_DEV")]
    pub dev: bool,

    /// Path to a TOML config file
    #[arg(long, short = 'c', global = true, env = "HUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Durable store backend (sqlite or postgres)
    #[arg(long, global = true, env = "HUB_STORE_BACKEND", value_parser = parse_store_backend)]
    pub store_backend: Option<StoreBackend>,

    /// SQLite database file (used when store_backend = sqlite)
    #[arg(long, global = true, env = "HUB_SQLITE_PATH")]
    pub sqlite_path: Option<PathBuf>,

    /// PostgreSQL connection URL (used when store_backend = postgres)
    #[arg(long, global = true, env = "HUB_POSTGRES_URL")]
    pub postgres_url: Option<String>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the hub server (default command)
    Start,
    /// Maintenance commands
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
}

#[derive(Subcommand, Clone, Debug)]
pub enum SystemCommands {
    /// Delete the local data directory (sqlite file). Requires confirmation.
    Prune {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Configuration derived from CLI arguments, merged over file/env/defaults
/// by [`super::config::AppConfig::load`].
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: bool,
    pub config: Option<PathBuf>,
    pub store_backend: Option<StoreBackend>,
    pub sqlite_path: Option<PathBuf>,
    pub postgres_url: Option<String>,
}

/// Parse CLI arguments and return config with command.
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    let config = CliConfig {
        host: cli.host,
        port: cli.port,
        dev: cli.dev,
        config: cli.config,
        store_backend: cli.store_backend,
        sqlite_path: cli.sqlite_path,
        postgres_url: cli.postgres_url,
    };
    (config, cli.command)
}
