use crate::cache::ResultCache;
use crate::cloud::ProviderFactory;
use crate::security;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REGION_CACHE_KEY: &str = "regions:enabled";

/// Outcome of region discovery. Never an error: permission or network
/// failures fall back to the default region with the failure recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionDiscovery {
    /// Enabled regions, or the default region on failure
    pub regions: Vec<String>,
    /// Whether discovery itself failed
    pub discovery_failed: bool,
    /// Sanitised discovery error, when it failed
    pub discovery_error: Option<String>,
}

/// Enumerates enabled regions with a TTL cache over the shared backend
pub struct RegionDiscoverer {
    factory: Arc<dyn ProviderFactory>,
    cache: Arc<ResultCache>,
    default_region: String,
    cache_ttl: Duration,
}

impl RegionDiscoverer {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        cache: Arc<ResultCache>,
        default_region: impl Into<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            factory,
            cache,
            default_region: default_region.into(),
            cache_ttl,
        }
    }

    /// Discover enabled regions, serving from cache when fresh
    pub async fn discover_enabled_regions(&self) -> RegionDiscovery {
        if let Some(regions) = self.cache.get::<Vec<String>>(REGION_CACHE_KEY).await {
            return RegionDiscovery {
                regions,
                discovery_failed: false,
                discovery_error: None,
            };
        }

        let result = match self.factory.cost_provider().await {
            Ok(provider) => provider.describe_regions().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(regions) if !regions.is_empty() => {
                info!(count = regions.len(), "Discovered enabled regions");
                self.cache
                    .put_with_ttl(REGION_CACHE_KEY, &regions, self.cache_ttl)
                    .await;
                RegionDiscovery {
                    regions,
                    discovery_failed: false,
                    discovery_error: None,
                }
            }
            Ok(_) => {
                warn!("Region discovery returned no regions; using default");
                RegionDiscovery {
                    regions: vec![self.default_region.clone()],
                    discovery_failed: true,
                    discovery_error: Some("Region discovery returned no regions".to_string()),
                }
            }
            Err(e) => {
                warn!(error = %e, "Region discovery failed; using default region");
                RegionDiscovery {
                    regions: vec![self.default_region.clone()],
                    discovery_failed: true,
                    discovery_error: Some(security::redact(&e.to_string())),
                }
            }
        }
    }

    /// Apply the region filtering hierarchy: discovered universe, then the
    /// operator allow-list, then the per-query filter. Each stage intersects.
    pub fn effective_regions(
        discovery: &RegionDiscovery,
        allowed_regions: &[String],
        query_regions: Option<&[String]>,
    ) -> Vec<String> {
        let mut regions = discovery.regions.clone();

        if !allowed_regions.is_empty() {
            let allowed: HashSet<&String> = allowed_regions.iter().collect();
            regions.retain(|r| allowed.contains(r));
        }

        if let Some(filter) = query_regions {
            if !filter.is_empty() {
                let wanted: HashSet<&String> = filter.iter().collect();
                regions.retain(|r| wanted.contains(r));
            }
        }

        regions
    }
}
