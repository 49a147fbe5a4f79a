/// Tag-compliance MCP server.
///
/// A read-only compliance engine for cloud resource tags: it ingests a
/// declarative tagging policy, discovers resources across every enabled
/// region in parallel, validates tags against the policy, attributes monthly
/// cost, and exposes the results as MCP tools.
// Cross-cutting modules
pub mod config;
pub mod context;
pub mod error;

// Policy and classification
pub mod catalog;
pub mod policy;

// Cloud access and caching
pub mod cache;
pub mod cloud;

// The compliance core
pub mod compliance;
pub mod cost;
pub mod scanner;
pub mod suggest;

// Guardrails, audit and history
pub mod audit;
pub mod history;
pub mod security;

// Tool surface and serving
pub mod report;
pub mod server;
pub mod tools;
pub mod transport;

// Re-export the types most embedders need
pub use config::Settings;
pub use context::RequestContext;
pub use error::{Error, Result};
pub use server::{McpServer, ServiceContainer};
pub use tools::Dispatcher;

/// Build the production service container from settings
pub async fn build(settings: Settings) -> Result<ServiceContainer> {
    ServiceContainer::build(settings).await
}

/// Build the container and wrap it in a ready-to-run stdio server
pub async fn serve(settings: Settings) -> Result<()> {
    let container = ServiceContainer::build(settings).await?;
    McpServer::new(container).run().await
}
