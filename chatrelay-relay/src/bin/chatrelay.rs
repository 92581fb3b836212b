//! `chatrelay` server binary.
//!
//! Environment:
//!
//! - `CHATRELAY_UPSTREAM_URL`: upstream chat-completions URL (required)
//! - `CHATRELAY_API_KEY`: upstream bearer token
//! - `CHATRELAY_DEADLINES`: path to a JSON deadline table
//! - `CHATRELAY_BIND`: listen address, default `127.0.0.1:8080`
//! - `RUST_LOG`: log filter, default `info`

use anyhow::Context;
use chatrelay_core::RelayConfig;
use chatrelay_relay::Relay;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env().context("loading relay configuration")?;
    let bind = std::env::var("CHATRELAY_BIND").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid CHATRELAY_BIND address: {bind}"))?;

    let relay = Relay::new(config)?;
    relay.serve(addr).await?;
    Ok(())
}
