pub mod daemon;
pub mod sync;

use clap::{Parser, Subcommand};
use serde_json::Value;

/// Sirius Sync - background tracker for repository and task-board syncs
#[derive(Parser, Debug)]
#[command(
    name = "sirius-sync",
    version,
    about = "Sirius Sync - starts connection syncs and tracks their tickets until they finish"
)]
pub struct Cli {
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Daemon port
    #[arg(long, default_value_t = 8390, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,

        /// Remote backend base URL (overrides config)
        #[arg(long = "backend-url")]
        backend_url: Option<String>,
    },

    /// Stop the daemon
    Stop,

    /// Show daemon status
    Status,

    /// Start a sync for a connection
    Sync {
        /// Connection id
        connection_id: i64,

        /// Connection type forwarded to the backend (e.g. repository, taskboard)
        #[arg(short = 't', long = "type")]
        connection_type: Option<String>,

        /// Wait until the sync completes or fails
        #[arg(short = 'w', long)]
        wait: bool,
    },

    /// List tracked sync jobs and the ticket queue
    Jobs {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget the sync job of a connection
    Clear {
        /// Connection id
        connection_id: i64,
    },
}

/// Build the base URL for the daemon HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the daemon is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to daemon at {}:{}. Is it running? (try: sirius-sync start)",
        host, port
    )
}

/// Turn a reqwest error into a user-facing error, hinting at `start` when the
/// daemon is unreachable.
pub(crate) fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// Decode a daemon response body, turning a non-2xx status into an error
/// carrying the daemon's `message`. A body that is not JSON reads as `null`.
pub(crate) async fn daemon_json(response: reqwest::Response) -> anyhow::Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(body);
    }
    match body["message"].as_str() {
        Some(message) => Err(anyhow::anyhow!("{}", message)),
        None => Err(anyhow::anyhow!("Daemon answered HTTP {}", status)),
    }
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Start {
            config,
            port,
            data_dir,
            backend_url,
        }) => {
            daemon::cmd_start(
                &cli.host,
                config.as_deref(),
                *port,
                data_dir.as_deref(),
                backend_url.as_deref(),
            )
            .await
        }
        Some(Commands::Stop) => daemon::cmd_stop(&cli.host, cli.port).await,
        Some(Commands::Status) => daemon::cmd_status(&cli.host, cli.port, cli.verbose).await,
        Some(Commands::Sync {
            connection_id,
            connection_type,
            wait,
        }) => {
            sync::cmd_sync(
                &cli.host,
                cli.port,
                *connection_id,
                connection_type.as_deref(),
                *wait,
                cli.verbose,
            )
            .await
        }
        Some(Commands::Jobs { json }) => sync::cmd_jobs(&cli.host, cli.port, *json).await,
        Some(Commands::Clear { connection_id }) => {
            sync::cmd_clear(&cli.host, cli.port, *connection_id).await
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
