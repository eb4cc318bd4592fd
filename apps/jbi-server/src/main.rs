#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
mod config;
mod signals;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::{AppConfig, LoggingConfig};
use jbi_container::JbiContainer;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// JBI Server - component container for binding components and service engines
#[derive(Parser)]
#[command(name = "jbi-server")]
#[command(about = "JBI Server - component container for binding components and service engines")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory override (overrides config)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Print effective configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the container
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_verbosity(cli.verbose);
    if let Some(root) = cli.root {
        config.container.root_dir = root;
    }

    init_logging(&config.logging)?;
    tracing::info!(container = %config.container.name, "JBI Server starting");

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_pretty_json()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("{}", config.to_pretty_json()?);
    Ok(())
}

async fn run_server(config: AppConfig) -> Result<()> {
    let container = JbiContainer::builder(config.container).build()?;
    container.start().await?;

    if let Err(e) = signals::wait_for_shutdown().await {
        tracing::warn!(error = %e, "shutdown: primary waiter failed; falling back to ctrl_c()");
        let _ = tokio::signal::ctrl_c().await;
    }

    container.shutdown().await;
    tracing::info!("JBI Server stopped");
    Ok(())
}

/// `RUST_LOG` wins over the configured (or `-v` selected) level.
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?;
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}
