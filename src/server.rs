use crate::audit::{AuditService, AuditStore, SqliteAuditStore};
use crate::cache::{CacheBackend, MemoryCacheBackend, ResultCache};
use crate::catalog::ResourceTypeCatalog;
use crate::cloud::{ProviderFactory, RegionDiscoverer, RegionalClientFactory};
use crate::config::Settings;
use crate::cost::{CostService, InstanceSizeWeights};
use crate::error::Result;
use crate::history::{HistoryService, HistoryStore, SqliteHistoryStore};
use crate::policy::PolicyStore;
use crate::scanner::MultiRegionScanner;
use crate::suggest::SuggestionService;
use crate::tools::Dispatcher;
use crate::transport::StdioServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything the dispatcher needs, constructed once at startup and passed
/// by reference. There are no process-global singletons.
pub struct ServiceContainer {
    pub settings: Settings,
    pub dispatcher: Arc<Dispatcher>,
}

impl ServiceContainer {
    /// Build the production container: CLI-backed cloud clients, SQLite
    /// stores, in-process cache backend.
    pub async fn build(settings: Settings) -> Result<Self> {
        let audit_store: Arc<dyn AuditStore> =
            Arc::new(SqliteAuditStore::open(&settings.stores.audit_store_path).await?);
        let history_store: Arc<dyn HistoryStore> =
            Arc::new(SqliteHistoryStore::open(&settings.stores.history_store_path).await?);
        let factory: Arc<dyn ProviderFactory> =
            Arc::new(RegionalClientFactory::new(settings.cloud.clone()));

        if settings.cache.cache_url.is_some() {
            // The backend trait is Redis-shaped; this build ships only the
            // in-process implementation
            warn!("cache_url is configured but no networked cache backend is compiled in; using the in-process cache");
        }
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCacheBackend::new());

        Self::build_with(settings, factory, audit_store, history_store, backend).await
    }

    /// Build a container around injected collaborators; the seam tests and
    /// embedders use
    pub async fn build_with(
        settings: Settings,
        factory: Arc<dyn ProviderFactory>,
        audit_store: Arc<dyn AuditStore>,
        history_store: Arc<dyn HistoryStore>,
        cache_backend: Arc<dyn CacheBackend>,
    ) -> Result<Self> {
        // A malformed policy is fatal by design: the server must not start
        // without one
        let policy_store = Arc::new(PolicyStore::load(&settings.policy_path)?);

        let catalog = match ResourceTypeCatalog::from_file(&settings.resource_types_config_path) {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => {
                warn!(error = %e, "Falling back to the built-in resource-type catalog");
                Arc::new(ResourceTypeCatalog::builtin())
            }
        };

        let result_cache = Arc::new(ResultCache::new(
            cache_backend,
            Duration::from_secs(settings.cache.cache_ttl_seconds),
        ));
        let discoverer = Arc::new(RegionDiscoverer::new(
            factory.clone(),
            result_cache.clone(),
            settings.cloud.default_region.clone(),
            Duration::from_secs(settings.cache.region_cache_ttl_seconds),
        ));
        let scanner = Arc::new(MultiRegionScanner::new(
            factory.clone(),
            policy_store.clone(),
            discoverer.clone(),
            catalog.clone(),
            settings.cloud.clone(),
            settings.scanner.clone(),
        ));
        let cost_service = Arc::new(CostService::new(
            catalog.clone(),
            InstanceSizeWeights::default(),
            settings.cost_attribution_tags.clone(),
        ));
        let suggestions = Arc::new(SuggestionService::new(
            factory.clone(),
            policy_store.clone(),
            settings.cloud.default_region.clone(),
        ));
        let audit = Arc::new(AuditService::new(audit_store));
        let history = Arc::new(HistoryService::new(history_store));

        let dispatcher = Arc::new(Dispatcher::new(
            settings.clone(),
            factory,
            scanner,
            discoverer,
            policy_store,
            catalog,
            cost_service,
            suggestions,
            audit,
            history,
            result_cache,
        )?);

        Ok(Self {
            settings,
            dispatcher,
        })
    }
}

/// The MCP server: one dispatcher behind a stdio framing adapter
pub struct McpServer {
    container: ServiceContainer,
}

impl McpServer {
    pub fn new(container: ServiceContainer) -> Self {
        Self { container }
    }

    /// Serve tool calls over stdio until the input closes
    pub async fn run(self) -> Result<()> {
        info!("Initializing tag-compliance MCP server");
        let transport = StdioServer::new(
            self.container.dispatcher.clone(),
            self.container.settings.limits.clone(),
        );
        info!("Server ready on stdio");
        transport.serve().await
    }
}
