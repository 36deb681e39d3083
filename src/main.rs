use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trellis::config::{AppConfig, LoggingConfig};
use trellis::domain::{ChainType, OrderSide, OrderSpec};
use trellis::engine::{ChainBuilder, ChainLocks, TransitionEngine};
use trellis::error::{Result, TrellisError};
use trellis::services::{Dispatcher, HealthServer, HealthState, Reconciler};
use trellis::store::{MemoryStore, OrderStore};
use trellis::venue::{PaperVenue, VenueClient};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Order chain orchestration engine")]
struct Cli {
    /// Configuration file (TOML, extension optional)
    #[arg(short, long, default_value = "trellis", env = "TRELLIS_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestration daemon
    Run {
        /// Create a demo bracket chain on startup
        #[arg(long)]
        demo: bool,
    },
    /// Load the configuration, report problems, and exit
    ValidateConfig,
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ValidateConfig) => validate_config(&cli.config),
        Some(Commands::Version) => {
            println!("trellis {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Run { demo }) => run_daemon(&cli.config, demo).await,
        None => run_daemon(&cli.config, false).await,
    }
}

fn validate_config(path: &str) -> Result<()> {
    let config = AppConfig::load_from(path)?;

    match config.validate() {
        Ok(()) => {
            println!("Configuration OK");
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                eprintln!("  {}", e);
            }
            Err(TrellisError::validation(format!(
                "{} configuration error(s)",
                errors.len()
            )))
        }
    }
}

async fn run_daemon(config_path: &str, demo: bool) -> Result<()> {
    // Load configuration before logging so the logging section applies
    let (config, load_err) = match AppConfig::load_from(config_path) {
        Ok(c) => (c, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    init_logging(&config.logging);
    if let Some(e) = load_err {
        warn!("Failed to load configuration: {} - using defaults", e);
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Configuration error: {}", e);
        }
        return Err(TrellisError::validation(format!(
            "{} configuration error(s)",
            errors.len()
        )));
    }

    info!("Starting trellis order chain orchestration engine");

    // Core wiring: one store, one venue, one lock registry, one engine
    let store: Arc<dyn OrderStore> = Arc::new(MemoryStore::new());
    let paper = Arc::new(PaperVenue::with_default_price(config.venue.default_price));
    let venue: Arc<dyn VenueClient> = paper;
    let locks = Arc::new(ChainLocks::new());
    let retry = config.retry_policy();

    let engine = Arc::new(TransitionEngine::new(
        Arc::clone(&store),
        Arc::clone(&venue),
        Arc::clone(&locks),
        retry.clone(),
    ));

    // Background services
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&venue),
        Arc::clone(&engine),
        config.reconciler_config(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        config.dispatcher_config(),
    )?);

    if config.reconciler.enabled {
        reconciler.start().await;
    } else {
        warn!("Reconciler disabled; venue state will not be polled");
    }
    if config.dispatcher.enabled {
        dispatcher.start().await;
    } else {
        warn!("Dispatcher disabled; webhook notifications will not be delivered");
    }

    // Health server and the task that feeds it from service stats
    let health_state = Arc::new(HealthState::new().with_store(Arc::clone(&store)));
    health_state.set_reconciler_running(config.reconciler.enabled);
    health_state.set_dispatcher_running(config.dispatcher.enabled);

    let health_handle = if config.health.enabled {
        let server = HealthServer::new(Arc::clone(&health_state), config.health.bind_addr.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Health server error: {}", e);
            }
        }))
    } else {
        None
    };

    let monitor_handle = {
        let health = Arc::clone(&health_state);
        let reconciler = Arc::clone(&reconciler);
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            let mut seen_reconcile = None;
            let mut seen_dispatch = None;
            let mut seen_transient = 0u64;
            loop {
                interval.tick().await;

                let r = reconciler.get_stats().await;
                if r.last_cycle != seen_reconcile {
                    seen_reconcile = r.last_cycle;
                    health.record_reconcile_cycle().await;
                    // A completed cycle with no new transient errors means
                    // the venue answered everything we asked
                    health
                        .record_venue_check(r.transient_errors == seen_transient)
                        .await;
                    seen_transient = r.transient_errors;
                }
                health.set_reconciler_running(reconciler.is_running());

                let d = dispatcher.get_stats().await;
                if d.last_cycle != seen_dispatch {
                    seen_dispatch = d.last_cycle;
                    health.record_dispatch_cycle().await;
                }
                health.set_dispatcher_running(dispatcher.is_running());
            }
        })
    };

    if demo {
        let builder = ChainBuilder::new(
            Arc::clone(&store),
            Arc::clone(&venue),
            Arc::clone(&locks),
            retry.clone(),
        );
        match builder
            .create_chain(
                ChainType::Bracket,
                vec![
                    OrderSpec::market("demo entry", "AAPL", OrderSide::Buy, dec!(10)),
                    OrderSpec::limit(
                        "demo take-profit",
                        "AAPL",
                        OrderSide::Sell,
                        dec!(10),
                        dec!(160),
                    ),
                    OrderSpec::stop("demo stop-loss", "AAPL", OrderSide::Sell, dec!(10), dec!(140)),
                ],
            )
            .await
        {
            Ok(chain) => info!(
                "Demo bracket chain {} created with {} orders",
                chain.chain_id,
                chain.orders.len()
            ),
            Err(e) => error!("Demo chain creation failed: {}", e),
        }
    }

    info!("Daemon is running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    info!("Shutting down...");
    reconciler.stop().await;
    dispatcher.stop().await;

    monitor_handle.abort();
    if let Some(handle) = health_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let fallback = format!("{},trellis=debug", logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
