use clap::Parser;
use tracing_subscriber::EnvFilter;

use sirius_sync::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The daemon logs at info by default; client commands stay quiet unless -v.
    let default_level = if cli.verbose {
        "debug"
    } else if matches!(cli.command, Some(Commands::Start { .. })) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
