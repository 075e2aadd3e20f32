use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::cli::CliConfig;
use super::constants::{DEFAULT_LEASE_SECONDS, MAX_LEASE_SECONDS};

/// Durable store backend for subscriptions, feeds, events, and the task queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Postgres,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Sqlite => write!(f, "sqlite"),
            StoreBackend::Postgres => write!(f, "postgres"),
        }
    }
}

/// `[server]` section of the TOML config file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: Option<bool>,
}

/// `[store]` section of the TOML config file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StoreFileConfig {
    pub backend: Option<StoreBackend>,
    pub sqlite_path: Option<String>,
    pub postgres_url: Option<String>,
}

/// `[subscriptions]` section of the TOML config file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SubscriptionsFileConfig {
    pub default_lease_seconds: Option<i64>,
    pub max_lease_seconds: Option<i64>,
}

/// Whole-file shape accepted from a `--config` TOML file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub store: Option<StoreFileConfig>,
    pub subscriptions: Option<SubscriptionsFileConfig>,
}

/// Resolved server network configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Relaxes the callback/topic port allowlist and the work-endpoint auth
    /// check.
    pub dev: bool,
}

/// Resolved store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: PathBuf,
    pub postgres_url: Option<String>,
}

/// Resolved subscription defaults.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionsConfig {
    pub default_lease_seconds: i64,
    pub max_lease_seconds: i64,
}

/// Fully resolved application configuration: defaults, overlaid by an
/// optional TOML config file, overlaid by environment variables and CLI
/// flags (highest precedence).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub subscriptions: SubscriptionsConfig,
}

impl AppConfig {
    /// Load configuration from all sources.
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. `./pubhub.toml` or the file named by `--config`
    /// 3. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let file_path = cli
            .config
            .clone()
            .or_else(|| {
                let local = PathBuf::from("pubhub.toml");
                local.exists().then_some(local)
            })
            .filter(|p| p.exists());

        let file_config = match &file_path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading config file");
                let built = config::Config::builder()
                    .add_source(config::File::from(path.as_path()))
                    .build()
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                built
                    .try_deserialize()
                    .with_context(|| format!("failed to parse config file: {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let file_server = file_config.server.unwrap_or_default();
        let file_store = file_config.store.unwrap_or_default();
        let file_subscriptions = file_config.subscriptions.unwrap_or_default();

        let server = ServerConfig {
            host: cli
                .host
                .clone()
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: cli.port.or(file_server.port).unwrap_or(8080),
            dev: cli.dev || file_server.dev.unwrap_or(false),
        };

        let backend = cli.store_backend.or(file_store.backend).unwrap_or_default();
        let sqlite_path = cli
            .sqlite_path
            .clone()
            .or_else(|| file_store.sqlite_path.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("pubhub.sqlite3"));
        let postgres_url = cli.postgres_url.clone().or(file_store.postgres_url);

        if matches!(backend, StoreBackend::Postgres) && postgres_url.is_none() {
            anyhow::bail!("store backend is postgres but no postgres_url was configured");
        }

        let store = StoreConfig {
            backend,
            sqlite_path,
            postgres_url,
        };

        let subscriptions = SubscriptionsConfig {
            default_lease_seconds: file_subscriptions
                .default_lease_seconds
                .unwrap_or(DEFAULT_LEASE_SECONDS),
            max_lease_seconds: file_subscriptions
                .max_lease_seconds
                .unwrap_or(MAX_LEASE_SECONDS),
        };

        Ok(Self {
            server,
            store,
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_empty_cli() {
        let cli = CliConfig::default();
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(
            config.subscriptions.default_lease_seconds,
            DEFAULT_LEASE_SECONDS
        );
    }

    #[test]
    fn cli_overrides_defaults() {
        let mut cli = CliConfig::default();
        cli.port = Some(9999);
        cli.dev = true;
        let config = AppConfig::load(&cli).unwrap();
        assert_eq!(config.server.port, 9999);
        assert!(config.server.dev);
    }

    #[test]
    fn postgres_backend_without_url_is_rejected() {
        let mut cli = CliConfig::default();
        cli.store_backend = Some(StoreBackend::Postgres);
        assert!(AppConfig::load(&cli).is_err());
    }
}
