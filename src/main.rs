use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aura_harness::config::HarnessConfig;
use aura_harness::reaper::{reap, ParentPidRecord};
use aura_harness::Orchestrator;

#[derive(Parser)]
#[command(author, version, about = "Bootstrap a local Aura test network")]
struct Cli {
    /// Harness configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "aura-harness.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the network and keep it running until Ctrl-C
    Up,
    /// Kill a node orphaned by a previous run and clear its pid record
    Reap,
    /// Print the master of ceremony address, creating it if needed
    Identity,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = HarnessConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration {}", cli.config.display()))?;
    config.apply_env();
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Up => up(config).await?,
        Commands::Reap => reap_orphans(&config)?,
        Commands::Identity => print_identity(config)?,
    }

    Ok(())
}

async fn up(config: HarnessConfig) -> Result<()> {
    let mut orchestrator = Orchestrator::from_config(config)?;
    let _guard = orchestrator.teardown_guard();

    let outcome = match orchestrator.bootstrap().await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(target: "aura", "bootstrap failed: {err}");
            orchestrator.teardown();
            return Err(err).context("bootstrap failed");
        }
    };

    println!("{} {}", outcome.endpoint, outcome.chain_id);
    info!(
        target: "aura",
        endpoint = %outcome.endpoint,
        chain_id = %outcome.chain_id,
        signer = %outcome.signer,
        "network is up; press Ctrl-C to tear it down"
    );

    signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    let killed = orchestrator.teardown();
    info!(target: "aura", killed, "network torn down");
    Ok(())
}

fn reap_orphans(config: &HarnessConfig) -> Result<()> {
    let record = ParentPidRecord::new(config.pid_file.clone());
    match reap(&record)? {
        Some(pid) => info!(target: "aura", pid, "reaped orphaned node"),
        None => info!(target: "aura", "no orphaned node recorded"),
    }
    Ok(())
}

fn print_identity(config: HarnessConfig) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config)?;
    let identity = orchestrator
        .identity_provider()
        .obtain()
        .context("failed to obtain master of ceremony identity")?;
    println!("{}", identity.address());
    Ok(())
}
