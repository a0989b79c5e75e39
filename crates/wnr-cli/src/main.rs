use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use wnr_poll::RelayConfig;

#[derive(Debug, Parser)]
#[command(name = "wnr-cli")]
#[command(about = "Work-note notification relay command-line interface")]
struct Cli {
    /// Path to the relay configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the tracker on the configured interval until terminated.
    Watch,
    /// Run exactly one poll cycle and print its report.
    Once,
    /// Drain queued messages out as email.
    Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => {
            wnr_poll::run_from_config(&config).await?;
        }
        Commands::Once => {
            let report = wnr_poll::run_cycle_once(&config).await?;
            println!(
                "cycle complete: cycle_id={} seen={} issues={} notes={} failed_sends={} warnings={}",
                report.cycle_id,
                report.issues_seen,
                report.issues_emitted,
                report.notes_emitted,
                report.sends_failed,
                report.warnings.len()
            );
        }
        Commands::Drain => {
            let summary = wnr_poll::drain_from_config(&config).await?;
            println!(
                "drain complete: drained={} mailed={}",
                summary.drained, summary.mailed
            );
        }
    }

    Ok(())
}
