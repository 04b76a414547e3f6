use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harbor_signing::{sign_now, RequestParts, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use reqwest::{header::CONTENT_TYPE, Client, Url};
use tracing::debug;

use crate::registry::SessionRecord;
use crate::routes::HeartbeatRequest;

#[derive(Parser, Debug)]
#[command(name = "beach-harbor")]
#[command(about = "Beach Harbor droplet broker and game-server callback client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broker (default behavior if no command specified)
    Serve,

    /// Send a signed heartbeat the way a game server does
    Heartbeat {
        /// Broker base URL
        #[arg(short, long, default_value = "http://localhost:8000")]
        url: String,

        /// Address the droplet reports for itself
        #[arg(long)]
        droplet_ip: String,

        /// Number of connected players
        #[arg(long, default_value_t = 0)]
        clients: u32,

        /// Shared signing secret; falls back to INTERNAL_HMAC_SECRET
        #[arg(long, env = "INTERNAL_HMAC_KEY", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Send a signed session teardown for a droplet
    End {
        /// Broker base URL
        #[arg(short, long, default_value = "http://localhost:8000")]
        url: String,

        #[arg(long)]
        droplet_ip: String,

        /// Shared signing secret; falls back to INTERNAL_HMAC_SECRET
        #[arg(long, env = "INTERNAL_HMAC_KEY", hide_env_values = true)]
        secret: Option<String>,
    },

    /// Reconcile the registry with the provider's tagged droplets once
    Sync,

    /// Print every registry record
    Inspect,
}

pub async fn send_heartbeat(
    base_url: &str,
    droplet_ip: &str,
    clients: u32,
    secret: &str,
) -> Result<String> {
    let url = endpoint(base_url, "/server/heartbeat")?;
    let body = serde_json::to_vec(&HeartbeatRequest {
        droplet_ip: droplet_ip.to_string(),
        connected_clients: clients,
    })?;
    send_signed(url, body, secret).await
}

pub async fn send_end(base_url: &str, droplet_ip: &str, secret: &str) -> Result<String> {
    let mut url = endpoint(base_url, "/server/end")?;
    url.query_pairs_mut().append_pair("droplet_ip", droplet_ip);
    send_signed(url, Vec::new(), secret).await
}

/// `--secret` / `INTERNAL_HMAC_KEY`, then `INTERNAL_HMAC_SECRET`, like the broker.
pub fn resolve_secret(explicit: Option<String>) -> Result<String> {
    explicit
        .into_iter()
        .chain(std::env::var("INTERNAL_HMAC_SECRET").ok())
        .map(|secret| secret.trim().to_string())
        .find(|secret| !secret.is_empty())
        .context("no signing secret: pass --secret or set INTERNAL_HMAC_KEY / INTERNAL_HMAC_SECRET")
}

fn endpoint(base_url: &str, path: &str) -> Result<Url> {
    let base = Url::parse(base_url).with_context(|| format!("invalid broker url {base_url}"))?;
    base.join(path)
        .with_context(|| format!("cannot build {path} from {base_url}"))
}

/// Signs exactly the path, query and bytes that go on the wire.
async fn send_signed(url: Url, body: Vec<u8>, secret: &str) -> Result<String> {
    let parts = RequestParts::new("POST", url.path())
        .with_query(url.query().unwrap_or(""))
        .with_body(&body);
    let headers = sign_now(secret.as_bytes(), &parts);
    debug!(%url, timestamp = %headers.timestamp, "sending signed request");

    let mut request = Client::new()
        .post(url.clone())
        .header(TIMESTAMP_HEADER, &headers.timestamp)
        .header(SIGNATURE_HEADER, &headers.signature);
    if !body.is_empty() {
        request = request.header(CONTENT_TYPE, "application/json");
    }
    let res = request.body(body).send().await?;

    let status = res.status();
    let text = res.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(text)
    } else {
        Err(anyhow::anyhow!("{url} returned {status}: {text}"))
    }
}

pub fn render_records(records: &[SessionRecord]) -> String {
    if records.is_empty() {
        return "registry is empty".to_string();
    }
    let mut out = format!(
        "{:<16} {:>7} {:<8} {:<12} {}\n",
        "ADDRESS", "CLIENTS", "TAG", "DROPLET", "LAST SEEN"
    );
    for record in records {
        let droplet = record
            .droplet_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<16} {:>7} {:<8} {:<12} {}\n",
            record.address,
            record.connected_clients,
            record.share_tag,
            droplet,
            record.last_seen.to_rfc3339()
        ));
    }
    out
}
