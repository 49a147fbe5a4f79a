use finops_mcp::config::Settings;
use finops_mcp::error::Result;
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the protocol frames
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("finops_mcp=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting tag-compliance MCP server");

    let settings = match env::args().nth(1) {
        Some(config_path) => Settings::from_file(config_path)?,
        None => Settings::from_env()?,
    };

    finops_mcp::serve(settings).await
}
