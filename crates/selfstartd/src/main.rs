//! selfstartd — SelfStart control-plane daemon
//!
//! Discovers labeled containers, orchestrates their lifecycle, load-balances
//! across their replicas, scales them on demand and shuts them off when idle.

use clap::{Parser, Subcommand};
use selfstartd::{Daemon, DaemonConfig, DaemonError};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "selfstartd")]
#[command(about = "SelfStart container control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (all five loops)
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/selfstart/config.json")]
        config: PathBuf,
    },

    /// Validate the config and check store/runtime reachability
    Check {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/selfstart/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/selfstart/config.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("selfstartd=info".parse().expect("valid directive"))
                .add_directive("selfstart_discovery=info".parse().expect("valid directive"))
                .add_directive("selfstart_orchestrator=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Check { config } => check(config).await,
        Commands::InitConfig { output } => init_config(output),
    };

    if let Err(e) = outcome {
        eprintln!("selfstartd: {e}");
        std::process::exit(e.exit_code());
    }
}

async fn run(config_path: PathBuf) -> Result<(), DaemonError> {
    info!(config = %config_path.display(), "starting selfstartd");
    let config = DaemonConfig::load(&config_path)?;
    info!(
        store = config.redis_url.as_deref().unwrap_or("memory"),
        dev_mode = config.dev_mode,
        base_domain = %config.base_domain,
        "loaded config"
    );

    let daemon = Daemon::build(config).await?;
    daemon.run().await?;
    info!("selfstartd stopped");
    Ok(())
}

async fn check(config_path: PathBuf) -> Result<(), DaemonError> {
    let config = DaemonConfig::load(&config_path)?;
    println!("config:   ok ({})", config_path.display());

    let daemon = Daemon::build(config).await?;
    daemon.store.ping().await.map_err(|e| {
        DaemonError::StoreUnreachable(e.to_string())
    })?;
    println!("store:    ok");
    daemon
        .runtime
        .list_all()
        .await
        .map_err(|e| DaemonError::RuntimeUnreachable(e.to_string()))?;
    println!("runtime:  ok");
    Ok(())
}

fn init_config(output: PathBuf) -> Result<(), DaemonError> {
    let config = DaemonConfig::default();
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file (or set REDIS_URL / DEV_MODE), then run:");
    println!("  selfstartd run --config {}", output.display());
    Ok(())
}
