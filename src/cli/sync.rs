// CLI sync commands: sync, jobs, clear

use chrono::Utc;
use reqwest::Client;
use serde_json::Value;

use super::{base_url, daemon_json, handle_request_error};

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// Pull every complete event block out of `buffer`, leaving any partial tail.
/// Comment-only blocks (keepalives) are skipped.
///
/// The buffer holds raw bytes so a UTF-8 character split across network
/// chunks is only decoded once its block is complete.
pub fn drain_sse_messages(buffer: &mut Vec<u8>) -> Vec<SseMessage> {
    let mut messages = Vec::new();

    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let raw: Vec<u8> = buffer.drain(..pos + 2).collect();
        let block = String::from_utf8_lossy(&raw);

        let mut event = String::new();
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim_start().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }

        if !event.is_empty() || !data.is_empty() {
            messages.push(SseMessage { event, data });
        }
    }

    messages
}

/// How a waited-on sync ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed,
    Failed(Option<String>),
    Cleared,
}

/// Interpret an event for `ticket`. Events for other tickets yield `None`.
pub fn wait_outcome(message: &SseMessage, ticket: &str) -> Option<WaitOutcome> {
    let json: Value = serde_json::from_str(&message.data).ok()?;
    if json["data"]["ticket"].as_str() != Some(ticket) {
        return None;
    }
    match message.event.as_str() {
        "completed" => Some(WaitOutcome::Completed),
        "failed" => Some(WaitOutcome::Failed(
            json["data"]["error"].as_str().map(str::to_string),
        )),
        "cleared" => Some(WaitOutcome::Cleared),
        _ => None,
    }
}

/// sirius-sync sync <connection-id>
pub async fn cmd_sync(
    host: &str,
    port: u16,
    connection_id: i64,
    connection_type: Option<&str>,
    wait: bool,
    verbose: bool,
) -> anyhow::Result<()> {
    let client = Client::new();

    // Subscribe before starting so a fast completion is not missed.
    let events = if wait {
        let url = format!("{}/api/events", base_url(host, port));
        let response = client
            .get(&url)
            .query(&[("connection_id", connection_id.to_string())])
            .send()
            .await
            .map_err(|e| handle_request_error(e, host, port))?;
        Some(response)
    } else {
        None
    };

    let url = format!(
        "{}/api/connections/{}/sync",
        base_url(host, port),
        connection_id
    );
    let mut request = client.post(&url);
    if let Some(t) = connection_type {
        request = request.query(&[("type", t)]);
    }
    let response = request
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let body = daemon_json(response).await?;

    let ticket = body["ticket"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Daemon response did not include a ticket"))?
        .to_string();

    if body["reused"].as_bool().unwrap_or(false) {
        println!(
            "Connection {} is already syncing (ticket: {})",
            connection_id, ticket
        );
    } else {
        println!("Sync started for connection {} (ticket: {})", connection_id, ticket);
    }

    match events {
        Some(response) => follow_until_finished(response, &ticket, verbose).await,
        None => Ok(()),
    }
}

async fn follow_until_finished(
    response: reqwest::Response,
    ticket: &str,
    verbose: bool,
) -> anyhow::Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    println!("Waiting for the sync to finish (Ctrl+C to stop waiting)...");

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {}", e))?;
        buffer.extend_from_slice(&chunk);

        for message in drain_sse_messages(&mut buffer) {
            if verbose && message.event == "polled" {
                if let Ok(json) = serde_json::from_str::<Value>(&message.data) {
                    let snapshots = json["data"]["snapshots"].as_u64().unwrap_or(0);
                    match json["data"]["error"].as_str() {
                        Some(error) => println!("  still running ({} snapshots, last error: {})", snapshots, error),
                        None => println!("  still running ({} snapshots)", snapshots),
                    }
                }
            }

            match wait_outcome(&message, ticket) {
                Some(WaitOutcome::Completed) => {
                    println!("Sync completed.");
                    return Ok(());
                }
                Some(WaitOutcome::Failed(reason)) => {
                    return Err(anyhow::anyhow!(
                        "Sync failed: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    ));
                }
                Some(WaitOutcome::Cleared) => {
                    println!("Sync job was cleared before it finished.");
                    return Ok(());
                }
                None => {}
            }
        }
    }

    Err(anyhow::anyhow!(
        "Event stream closed before the sync finished"
    ))
}

/// sirius-sync jobs
pub async fn cmd_jobs(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/sync-jobs", base_url(host, port));

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let body = daemon_json(response).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    print!("{}", render_jobs_table(&body, Utc::now().timestamp_millis()));
    Ok(())
}

/// Render the `{ jobsByConnectionId, queue }` view as a table.
pub fn render_jobs_table(body: &Value, now_ms: i64) -> String {
    let jobs: Vec<&Value> = body["jobsByConnectionId"]
        .as_object()
        .map(|m| m.values().collect())
        .unwrap_or_default();

    if jobs.is_empty() {
        return "No sync jobs.\n".to_string();
    }

    let mut out = format!(
        "{:<12}{:<12}{:<11}{:<26}{:<7}{:<18}{}\n",
        "CONNECTION", "TYPE", "STATUS", "TICKET", "SNAPS", "UPDATED", "LAST ERROR"
    );

    for job in jobs {
        let connection = job["connectionId"]
            .as_i64()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        let connection_type = job["connectionType"].as_str().unwrap_or("-");
        let status = job["status"].as_str().unwrap_or("?");
        let ticket = job["ticket"].as_str().unwrap_or("?");
        let snapshots = job["snapshots"].as_array().map(Vec::len).unwrap_or(0);
        let updated = job["updatedAt"]
            .as_i64()
            .map(|at| format_relative_ms(at, now_ms))
            .unwrap_or_else(|| "-".to_string());
        let last_error = job["lastError"].as_str().unwrap_or("-");

        out.push_str(&format!(
            "{:<12}{:<12}{:<11}{:<26}{:<7}{:<18}{}\n",
            connection, connection_type, status, ticket, snapshots, updated, last_error
        ));
    }

    let queue: Vec<&str> = body["queue"]
        .as_array()
        .map(|q| q.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if queue.is_empty() {
        out.push_str("\nQueue: empty\n");
    } else {
        out.push_str(&format!("\nQueue: {}\n", queue.join(", ")));
    }

    out
}

fn format_relative_ms(at_ms: i64, now_ms: i64) -> String {
    let secs = (now_ms - at_ms).max(0) / 1000;
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

/// sirius-sync clear <connection-id>
pub async fn cmd_clear(host: &str, port: u16, connection_id: i64) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!(
        "{}/api/sync-jobs/{}",
        base_url(host, port),
        connection_id
    );

    let response = client
        .delete(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    daemon_json(response).await?;
    println!("Cleared sync job for connection {}", connection_id);
    Ok(())
}
