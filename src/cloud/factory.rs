use crate::cloud::{AwsCliClient, CloudProvider};
use crate::config::CloudSettings;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Hands out region-bound providers. The seam the scanner and the tools use,
/// so tests can substitute a mock fleet.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Provider bound to one region, memoised across scans
    async fn provider_for(&self, region: &str) -> Result<Arc<dyn CloudProvider>>;

    /// Provider used for cost and region-discovery queries. The cost-explorer
    /// handle is never regionalised.
    async fn cost_provider(&self) -> Result<Arc<dyn CloudProvider>>;
}

/// Factory producing one AWS client per region on demand.
///
/// Clients are memoised so repeated scans reuse handles; reads dominate, so
/// the map sits behind a read-mostly lock.
pub struct RegionalClientFactory {
    settings: CloudSettings,
    clients: RwLock<HashMap<String, Arc<AwsCliClient>>>,
}

impl RegionalClientFactory {
    pub fn new(settings: CloudSettings) -> Self {
        Self {
            settings,
            clients: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProviderFactory for RegionalClientFactory {
    async fn provider_for(&self, region: &str) -> Result<Arc<dyn CloudProvider>> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(region) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().await;
        // Another caller may have raced us between the locks
        if let Some(client) = clients.get(region) {
            return Ok(client.clone());
        }
        let client = Arc::new(AwsCliClient::new(
            region,
            &self.settings.cost_region,
            self.settings.min_call_interval_ms,
        )?);
        clients.insert(region.to_string(), client.clone());
        debug!(region, "Created regional cloud client");
        Ok(client)
    }

    async fn cost_provider(&self) -> Result<Arc<dyn CloudProvider>> {
        let cost_region = self.settings.cost_region.clone();
        self.provider_for(&cost_region).await
    }
}
