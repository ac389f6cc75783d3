use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use postgresql_ssh_mcp::config::{self, Transport};
use postgresql_ssh_mcp::{http, server};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing — MUST write to stderr, not stdout.
    // The MCP server uses stdout as the JSON-RPC transport; any log line on
    // stdout would corrupt the protocol stream and appear as malformed input
    // to the client.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    info!("postgresql-ssh-mcp starting");

    let config = config::env::load_config()?;
    config.validate()?;
    let config = Arc::new(config);
    info!("configuration loaded");

    match config.transport {
        Transport::Stdio => server::run_stdio(config).await,
        Transport::Http => http::run_http(config).await,
    }
}
