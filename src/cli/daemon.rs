// CLI daemon commands: start, stop, status

use std::path::PathBuf;

use reqwest::Client;

use super::{base_url, daemon_json, handle_request_error};
use crate::daemon::DaemonOverrides;

/// sirius-sync start
///
/// Runs the daemon in this process until it is stopped.
pub async fn cmd_start(
    host: &str,
    config: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
    backend_url: Option<&str>,
) -> anyhow::Result<()> {
    // Only forward the global --host when it differs from the default, so the
    // config file value still applies otherwise.
    let host_override = (host != "127.0.0.1").then(|| host.to_string());

    crate::daemon::start_daemon(DaemonOverrides {
        config_path: config.map(PathBuf::from),
        data_dir: data_dir.map(PathBuf::from),
        host: host_override,
        port: port_override,
        backend_url: backend_url.map(str::to_string),
    })
    .await
}

/// sirius-sync stop
pub async fn cmd_stop(host: &str, port: u16) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/shutdown", base_url(host, port));

    let response = client
        .post(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    daemon_json(response).await?;
    println!("Daemon is shutting down...");
    Ok(())
}

/// sirius-sync status
pub async fn cmd_status(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let body = daemon_json(response).await?;

    let daemon_status = body["status"].as_str().unwrap_or("unknown");
    let version = body["version"].as_str().unwrap_or("unknown");
    let uptime = body["uptime_seconds"].as_u64().unwrap_or(0);
    let active_jobs = body["active_jobs"].as_u64().unwrap_or(0);
    let total_jobs = body["total_jobs"].as_u64().unwrap_or(0);
    let queue_length = body["queue_length"].as_u64().unwrap_or(0);
    let worker = if body["worker_idle"].as_bool().unwrap_or(true) {
        "idle"
    } else {
        "polling"
    };
    let backend = body["backend_url"].as_str().unwrap_or("unknown");
    let data_dir = body["data_dir"].as_str().unwrap_or("unknown");

    println!("Daemon Status: {}", daemon_status);
    println!("  Data Dir:    {}", data_dir);
    println!("  Backend:     {}", backend);
    println!(
        "  Jobs:        {} active / {} total",
        active_jobs, total_jobs
    );
    println!("  Queue:       {} ticket(s), worker {}", queue_length, worker);
    println!("  Uptime:      {}", format_uptime(uptime));
    println!("  Version:     {}", version);

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&body)?);
    }

    Ok(())
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
