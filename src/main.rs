//! PulseGuard command line.

use pulseguard::config::ServerConfig;
use pulseguard::db::{DurableStore, Store};
use pulseguard::hub::Hub;
use pulseguard::probe::{NetworkProbe, Probe};
use pulseguard::scheduler::{run_once, Scheduler, SchedulerOptions};
use pulseguard::status::{Aggregator, LogHook};
use pulseguard::web::WebServer;

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "pulseguard", version, about = "Server health monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database path (overrides PULSEGUARD_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and the web server
    Serve {
        /// HTTP port (overrides PULSEGUARD_HTTP_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Check every enabled server once and exit
    Check,

    /// Run the periodic scheduler without the web server
    Schedule {
        /// Scheduler tick in seconds
        #[arg(long, default_value = "1", value_parser = parse_tick)]
        tick: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "pulseguard=debug" } else { "pulseguard=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    let mut cfg = ServerConfig::load();
    if let Some(db) = cli.db {
        cfg.db_path = db;
    }

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Using database at {}", cfg.db_path);

    let hub = Arc::new(Hub::from_config(&cfg));
    let probe: Arc<dyn Probe> = Arc::new(NetworkProbe::new(cfg.status_policy)?);
    let aggregator =
        Aggregator::new(store.clone(), hub.clone(), &cfg).with_hook(Arc::new(LogHook));

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                cfg.http_port = port;
            }
            let scheduler = Arc::new(Scheduler::start(
                store.clone(),
                probe,
                aggregator,
                SchedulerOptions::from(&cfg),
            )?);

            let server = WebServer::new(cfg, store, scheduler.clone(), hub);
            server.start(shutdown_signal()).await?;
            scheduler.shutdown().await;
        }
        Commands::Check => {
            let mut aggregator = aggregator;
            let outcomes = run_once(store.as_ref(), probe, &mut aggregator, cfg.max_concurrency).await?;
            println!("Ran {} checks", outcomes.len());
            for (id, status) in outcomes {
                println!("Server {}: {}", id, status);
            }
        }
        Commands::Schedule { tick } => {
            cfg.tick_interval = tick;
            let servers = store.list_servers()?.iter().filter(|s| s.enabled).count();
            println!("Scheduling {} servers every {:?}, Ctrl+C to stop", servers, cfg.tick_interval);

            let scheduler = Scheduler::start(store, probe, aggregator, SchedulerOptions::from(&cfg))?;
            shutdown_signal().await;
            scheduler.shutdown().await;
        }
    }

    Ok(())
}

/// Longest accepted scheduler tick.
const MAX_TICK_SECS: f64 = 3600.0;

fn parse_tick(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw.trim().parse().map_err(|_| format!("not a number: {raw}"))?;
    if !(secs > 0.0 && secs <= MAX_TICK_SECS) {
        return Err(format!("tick must be between 0 and {MAX_TICK_SECS} seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
