//! Core application: wires the store, task queue, and the four service
//! layers together, then drives the HTTP server and background workers.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{ApiServer, AppState};
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{EVENT_QUEUE, FEED_QUEUE, POLLING_QUEUE, SUBSCRIPTION_QUEUE};
use crate::core::shutdown::ShutdownService;
use crate::delivery::DeliveryEngine;
use crate::feed::FeedPipeline;
use crate::feed::differ::QuickXmlDiffer;
use crate::poller::BootstrapPoller;
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::subscriptions::SubscriptionManager;
use crate::utils::crypto::generate_token;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub queue: Arc<TaskQueue>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub feeds: Arc<FeedPipeline>,
    pub delivery: Arc<DeliveryEngine>,
    pub poller: Arc<BootstrapPoller>,
    /// Shared secret the queue dispatcher presents on `/work/*` callbacks;
    /// generated fresh per process, since it only authenticates the hub
    /// talking to itself.
    pub task_queue_secret: String,
}

impl CoreApp {
    /// Run the application with CLI argument parsing.
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("hub starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "parsed command");

        if let Some(Commands::System { command: system_cmd }) = command {
            return Self::handle_system_command(&cli_config, system_cmd);
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let store = Arc::new(Store::open(&config).await?);

        let task_queue_secret = generate_token(32);
        let dispatch_host = if config.server.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            config.server.host.as_str()
        };
        let base_url = format!("http://{dispatch_host}:{}", config.server.port);
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            base_url,
            task_queue_secret.clone(),
        ));

        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            config.subscriptions.default_lease_seconds,
            config.subscriptions.max_lease_seconds,
            config.server.dev,
        ));
        let differ: Arc<dyn crate::feed::differ::FeedDiffer> = Arc::new(QuickXmlDiffer);
        let feeds = Arc::new(FeedPipeline::new(Arc::clone(&store), Arc::clone(&queue), differ));
        let delivery = Arc::new(DeliveryEngine::new(Arc::clone(&store), Arc::clone(&queue)));
        let poller = Arc::new(BootstrapPoller::new(Arc::clone(&store), Arc::clone(&queue)));

        let shutdown = ShutdownService::new();

        Ok(Self {
            shutdown,
            config,
            store,
            queue,
            subscriptions,
            feeds,
            delivery,
            poller,
            task_queue_secret,
        })
    }

    pub fn state(&self) -> AppState {
        AppState {
            subscriptions: Arc::clone(&self.subscriptions),
            feeds: Arc::clone(&self.feeds),
            delivery: Arc::clone(&self.delivery),
            poller: Arc::clone(&self.poller),
            store: Arc::clone(&self.store),
        }
    }

    fn handle_system_command(cli: &CliConfig, cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(cli, yes),
        }
    }

    fn prune_data(cli: &CliConfig, skip_confirm: bool) -> Result<()> {
        let config = AppConfig::load(cli)?;
        if !matches!(config.store.backend, crate::core::config::StoreBackend::Sqlite) {
            anyhow::bail!("system prune only applies to the sqlite backend");
        }
        let path = &config.store.sqlite_path;
        if !path.exists() {
            println!("Nothing to prune: {}", path.display());
            return Ok(());
        }

        if !skip_confirm {
            print!("Delete {}? [y/N] ", path.display());
            use std::io::Write;
            std::io::stdout().flush().ok();
            let mut input = String::new();
            std::io::stdin().read_line(&mut input).context("failed to read confirmation")?;
            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Aborted.");
                return Ok(());
            }
        }

        std::fs::remove_file(path)
            .with_context(|| format!("failed to delete sqlite file: {}", path.display()))?;
        println!("Pruned: {}", path.display());
        Ok(())
    }

    fn init_logging() {
        let default_filter = "info,pubhub_server=debug".to_string();
        let filter = std::env::var("HUB_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        app.shutdown.install_signal_handlers();
        app.start_background_tasks().await;

        tracing::info!(
            host = %app.config.server.host,
            port = app.config.server.port,
            backend = %app.config.store.backend,
            dev = app.config.server.dev,
            "hub configured"
        );

        let server = ApiServer::new(app);
        let app = server.start().await?;
        app.shutdown.shutdown().await;
        app.store.close().await;

        Ok(())
    }

    pub async fn start_background_tasks(&self) {
        for handle in self.store.start_maintenance_tasks(self.shutdown.subscribe()) {
            self.shutdown.register(handle).await;
        }

        for queue in [SUBSCRIPTION_QUEUE, FEED_QUEUE, EVENT_QUEUE, POLLING_QUEUE] {
            let handle = self.queue.start_dispatcher(queue, self.shutdown.subscribe());
            self.shutdown.register(handle).await;
        }

        tracing::debug!("background tasks started");
    }
}
