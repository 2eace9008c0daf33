//! Weft CLI - validate and launch weaving deployments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod error;

#[derive(Debug, Parser)]
#[command(
    name = "weft",
    about = "Colocate LLM serving instances on shared GPUs with workload weaving",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a deployment configuration and print its layout
    Check {
        /// Path to the deployment config (JSON)
        config: PathBuf,
    },
    /// Run the weaving runtime against the simulated step executor
    Serve {
        /// Path to the deployment config (JSON)
        config: PathBuf,
        /// Submit this many smoke requests per model, wait for them,
        /// then exit instead of serving
        #[arg(long)]
        smoke: Option<usize>,
        /// Seconds between metric reports while serving
        #[arg(long, default_value_t = 5)]
        report_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_cli=info,weft_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check { config } => commands::check::run(&config)?,
        Command::Serve {
            config,
            smoke,
            report_interval,
        } => commands::serve::run(&config, smoke, report_interval).await?,
    }
    Ok(())
}
