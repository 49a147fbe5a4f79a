use crate::catalog::ResourceTypeCatalog;
use crate::cloud::{
    CloudProvider, ProviderFactory, RegionDiscoverer, Resource, GLOBAL_REGION,
};
use crate::compliance::{
    ComplianceResult, ComplianceService, SeverityFilter, UntaggedResource, Violation,
};
use crate::config::{CloudSettings, ScannerSettings};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::policy::{PolicyStore, TagPolicy};
use crate::security;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// One compliance scan request
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Canonical resource types to scan
    pub resource_types: Vec<String>,
    /// Per-query region filter
    pub regions: Option<Vec<String>>,
    /// Tag equality filters a resource must match to be scanned
    pub tag_filters: BTreeMap<String, String>,
    /// Which violations to emit
    pub severity: SeverityFilter,
}

/// Per-region slice of the aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionBreakdown {
    pub total_resources: usize,
    pub compliant_resources: usize,
    pub violation_count: usize,
    pub compliance_score: f64,
}

/// A region whose scan failed, with the sanitised reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedRegion {
    pub region: String,
    pub error: String,
}

/// How the region set was arrived at, and what happened to each region
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegionMetadata {
    pub total_regions: usize,
    pub successful_regions: Vec<String>,
    pub failed_regions: Vec<FailedRegion>,
    pub skipped_regions: Vec<String>,
    pub discovery_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_error: Option<String>,
}

/// Aggregate of a multi-region scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRegionComplianceResult {
    /// Aggregated compliance result across every scanned region
    pub result: ComplianceResult,
    /// Keyed per-region breakdown; the global bucket appears under `global`
    pub region_breakdown: HashMap<String, RegionBreakdown>,
    pub region_metadata: RegionMetadata,
    /// Untagged view over the same scan
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub untagged_resources: Vec<UntaggedResource>,
}

struct RegionScan {
    resources: Vec<Resource>,
    result: ComplianceResult,
    untagged: Vec<UntaggedResource>,
}

/// Fans compliance scans out across regions.
///
/// Regions are the unit of parallelism; a bounded worker pool drains the
/// region queue and reports on a result channel. Workers share no mutable
/// state.
pub struct MultiRegionScanner {
    factory: Arc<dyn ProviderFactory>,
    policy_store: Arc<PolicyStore>,
    discoverer: Arc<RegionDiscoverer>,
    catalog: Arc<ResourceTypeCatalog>,
    cloud_settings: CloudSettings,
    scanner_settings: ScannerSettings,
}

impl MultiRegionScanner {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        policy_store: Arc<PolicyStore>,
        discoverer: Arc<RegionDiscoverer>,
        catalog: Arc<ResourceTypeCatalog>,
        cloud_settings: CloudSettings,
        scanner_settings: ScannerSettings,
    ) -> Self {
        Self {
            factory,
            policy_store,
            discoverer,
            catalog,
            cloud_settings,
            scanner_settings,
        }
    }

    /// Run a scan and return the aggregate
    pub async fn scan(&self, request: &ScanRequest, ctx: &RequestContext) -> MultiRegionComplianceResult {
        self.scan_collecting(request, ctx).await.0
    }

    /// Run a scan and additionally return the scanned resources, for callers
    /// that feed them to the cost service within the same request
    pub async fn scan_collecting(
        &self,
        request: &ScanRequest,
        ctx: &RequestContext,
    ) -> (MultiRegionComplianceResult, Vec<Resource>) {
        let policy = self.policy_store.current().await;

        let discovery = self.discoverer.discover_enabled_regions().await;
        let effective = RegionDiscoverer::effective_regions(
            &discovery,
            &self.cloud_settings.allowed_regions,
            request.regions.as_deref(),
        );
        let skipped: Vec<String> = discovery
            .regions
            .iter()
            .filter(|r| !effective.contains(*r))
            .cloned()
            .collect();

        let (regional_types, global_types) = self.partition_types(&request.resource_types);

        // Work units: one per effective region, plus the global unit. Global
        // resources ignore every region filter.
        let mut units: Vec<(String, Vec<String>)> = Vec::new();
        if !regional_types.is_empty() {
            for region in &effective {
                units.push((region.clone(), regional_types.clone()));
            }
        }
        if !global_types.is_empty() {
            units.push((GLOBAL_REGION.to_string(), global_types));
        }

        info!(
            correlation_id = %ctx.correlation_id,
            regions = effective.len(),
            units = units.len(),
            "Starting multi-region scan"
        );

        let completed = self.run_units(&units, &policy, request, ctx).await;

        let mut metadata = RegionMetadata {
            total_regions: units.len(),
            successful_regions: Vec::new(),
            failed_regions: Vec::new(),
            skipped_regions: skipped,
            discovery_failed: discovery.discovery_failed,
            discovery_error: discovery.discovery_error.clone(),
        };

        let mut total = 0usize;
        let mut compliant = 0usize;
        let mut violations: Vec<Violation> = Vec::new();
        let mut untagged: Vec<UntaggedResource> = Vec::new();
        let mut resources: Vec<Resource> = Vec::new();
        let mut breakdown: HashMap<String, RegionBreakdown> = HashMap::new();

        for (region, outcome) in completed {
            match outcome {
                Ok(scan) => {
                    total += scan.result.total_resources;
                    compliant += scan.result.compliant_resources;
                    breakdown.insert(
                        region.clone(),
                        RegionBreakdown {
                            total_resources: scan.result.total_resources,
                            compliant_resources: scan.result.compliant_resources,
                            violation_count: scan.result.violations.len(),
                            compliance_score: scan.result.compliance_score,
                        },
                    );
                    // Per-region blocks stay contiguous in completion order;
                    // each block is already deterministically sorted
                    violations.extend(scan.result.violations);
                    untagged.extend(scan.untagged);
                    resources.extend(scan.resources);
                    metadata.successful_regions.push(region);
                }
                Err(e) => {
                    warn!(region = %region, error = %e, "Region scan failed");
                    metadata.failed_regions.push(FailedRegion {
                        region,
                        error: failure_label(&e),
                    });
                }
            }
        }

        let aggregate = MultiRegionComplianceResult {
            result: ComplianceResult {
                compliance_score: ComplianceService::score(compliant, total),
                total_resources: total,
                compliant_resources: compliant,
                non_compliant_resources: total - compliant,
                violations,
                cost_attribution_gap: 0.0,
                scanned_at: Utc::now(),
            },
            region_breakdown: breakdown,
            region_metadata: metadata,
            untagged_resources: untagged,
        };
        (aggregate, resources)
    }

    /// Spawn the bounded worker pool and drain the result channel until every
    /// unit reports or the request deadline fires
    async fn run_units(
        &self,
        units: &[(String, Vec<String>)],
        policy: &Arc<TagPolicy>,
        request: &ScanRequest,
        ctx: &RequestContext,
    ) -> Vec<(String, Result<RegionScan>)> {
        if units.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.scanner_settings.max_concurrent_regions));
        let region_timeout = Duration::from_secs(self.scanner_settings.region_scan_timeout_seconds);
        let (tx, mut rx) = mpsc::channel::<(String, Result<RegionScan>)>(units.len());

        for (region, types) in units {
            let factory = self.factory.clone();
            let policy = policy.clone();
            let severity = request.severity;
            let tag_filters = request.tag_filters.clone();
            let types = types.clone();
            let region = region.clone();
            let default_region = self.cloud_settings.default_region.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let outcome = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::cancelled("Scanner shut down"))?;
                    // Global listings are served from the default region's
                    // client; the APIs are account-level
                    let provider_region = if region == GLOBAL_REGION {
                        default_region.as_str()
                    } else {
                        region.as_str()
                    };
                    let provider = factory.provider_for(provider_region).await?;
                    tokio::time::timeout(
                        region_timeout,
                        scan_one_region(provider, &policy, &region, &types, &tag_filters, severity),
                    )
                    .await
                    .map_err(|_| Error::timeout(format!("Region {} scan timed out", region)))?
                }
                .await;
                let _ = tx.send((region, outcome)).await;
            });
        }
        drop(tx);

        let overall = async {
            match ctx.deadline {
                Some(deadline) => {
                    let remaining = (deadline - Utc::now()).num_milliseconds().max(0) as u64;
                    tokio::time::sleep(Duration::from_millis(remaining)).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(overall);

        let mut completed: Vec<(String, Result<RegionScan>)> = Vec::with_capacity(units.len());
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(entry) => {
                        completed.push(entry);
                        if completed.len() == units.len() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut overall => {
                    let done: HashSet<String> = completed.iter().map(|(r, _)| r.clone()).collect();
                    for (region, _) in units {
                        if !done.contains(region) {
                            completed.push((
                                region.clone(),
                                Err(Error::cancelled("Request deadline exceeded")),
                            ));
                        }
                    }
                    debug!("Request deadline fired; returning aggregate so far");
                    break;
                }
            }
        }
        completed
    }

    /// Split requested types into regional and global sets. Unknown types are
    /// treated as regional so the provider decides whether they exist.
    fn partition_types(&self, requested: &[String]) -> (Vec<String>, Vec<String>) {
        let mut regional = Vec::new();
        let mut global = Vec::new();
        for resource_type in requested {
            if self.catalog.is_global(resource_type) {
                global.push(resource_type.clone());
            } else {
                regional.push(resource_type.clone());
            }
        }
        (regional, global)
    }
}

/// Scan one region: list every requested type, filter, validate
async fn scan_one_region(
    provider: Arc<dyn CloudProvider>,
    policy: &TagPolicy,
    region: &str,
    resource_types: &[String],
    tag_filters: &BTreeMap<String, String>,
    severity: SeverityFilter,
) -> Result<RegionScan> {
    let mut resources: Vec<Resource> = Vec::new();
    for resource_type in resource_types {
        let mut listed = provider.list_resources(resource_type).await?;
        if region == GLOBAL_REGION {
            // Account-level resources always surface under the synthetic
            // global region, whatever the ARN said
            for resource in &mut listed {
                resource.region = GLOBAL_REGION.to_string();
            }
        }
        resources.extend(listed);
    }

    if !tag_filters.is_empty() {
        resources.retain(|r| {
            tag_filters
                .iter()
                .all(|(k, v)| r.tags.get(k).map(|tag| tag == v).unwrap_or(false))
        });
    }

    let result = ComplianceService::evaluate(&resources, policy, severity);
    let untagged = ComplianceService::find_untagged(&resources, policy);
    Ok(RegionScan {
        resources,
        result,
        untagged,
    })
}

/// Short, sanitised failure label for region metadata
fn failure_label(error: &Error) -> String {
    match error {
        Error::Timeout(_) => "timeout".to_string(),
        Error::Cancelled(_) => "cancelled".to_string(),
        other => security::redact(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCacheBackend, ResultCache};
    use crate::cloud::{CostPeriod, ServiceCost};
    use async_trait::async_trait;

    /// Provider fleet with canned per-region resources and optional delays
    struct MockFleet {
        by_region: HashMap<String, Vec<Resource>>,
        delay: HashMap<String, Duration>,
        regions: Vec<String>,
    }

    struct MockProvider {
        region: String,
        resources: Vec<Resource>,
        delay: Option<Duration>,
        regions: Vec<String>,
    }

    #[async_trait]
    impl CloudProvider for MockProvider {
        fn region(&self) -> &str {
            &self.region
        }

        async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .resources
                .iter()
                .filter(|r| r.resource_type == resource_type)
                .cloned()
                .collect())
        }

        async fn get_tags_for_arns(
            &self,
            _arns: &[String],
        ) -> Result<HashMap<String, HashMap<String, String>>> {
            Ok(HashMap::new())
        }

        async fn get_cost_by_service(&self, _period: &CostPeriod) -> Result<Vec<ServiceCost>> {
            Ok(Vec::new())
        }

        async fn describe_regions(&self) -> Result<Vec<String>> {
            Ok(self.regions.clone())
        }
    }

    #[async_trait]
    impl ProviderFactory for MockFleet {
        async fn provider_for(&self, region: &str) -> Result<Arc<dyn CloudProvider>> {
            Ok(Arc::new(MockProvider {
                region: region.to_string(),
                resources: self.by_region.get(region).cloned().unwrap_or_default(),
                delay: self.delay.get(region).copied(),
                regions: self.regions.clone(),
            }))
        }

        async fn cost_provider(&self) -> Result<Arc<dyn CloudProvider>> {
            self.provider_for("us-east-1").await
        }
    }

    fn instance(region: &str, id: &str, cost_center: Option<&str>) -> Resource {
        let mut tags = HashMap::new();
        if let Some(value) = cost_center {
            tags.insert("CostCenter".to_string(), value.to_string());
        }
        Resource {
            arn: format!("arn:aws:ec2:{}:123456789012:instance/{}", region, id),
            resource_type: "ec2:instance".to_string(),
            region: region.to_string(),
            tags,
            created_at: None,
            state: None,
            instance_size: None,
        }
    }

    fn policy_store() -> Arc<PolicyStore> {
        let policy = TagPolicy::from_str(
            r#"{"version": "1", "required_tags": [{"name": "CostCenter"}], "naming_rules": {"enabled": false}}"#,
        )
        .unwrap();
        Arc::new(PolicyStore::from_policy(policy))
    }

    fn scanner_with(
        fleet: MockFleet,
        max_concurrent: usize,
        region_timeout_secs: u64,
    ) -> MultiRegionScanner {
        let factory: Arc<dyn ProviderFactory> = Arc::new(fleet);
        let cache = Arc::new(ResultCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(60),
        ));
        let discoverer = Arc::new(RegionDiscoverer::new(
            factory.clone(),
            cache,
            "us-east-1",
            Duration::from_secs(60),
        ));
        let mut scanner_settings = ScannerSettings::default();
        scanner_settings.max_concurrent_regions = max_concurrent;
        scanner_settings.region_scan_timeout_seconds = region_timeout_secs;
        MultiRegionScanner::new(
            factory,
            policy_store(),
            discoverer,
            Arc::new(ResourceTypeCatalog::builtin()),
            CloudSettings::default(),
            scanner_settings,
        )
    }

    fn request() -> ScanRequest {
        ScanRequest {
            resource_types: vec!["ec2:instance".to_string()],
            regions: None,
            tag_filters: BTreeMap::new(),
            severity: SeverityFilter::All,
        }
    }

    #[tokio::test]
    async fn aggregates_across_regions() {
        let fleet = MockFleet {
            by_region: HashMap::from([
                (
                    "us-east-1".to_string(),
                    vec![
                        instance("us-east-1", "i-1", Some("Engineering")),
                        instance("us-east-1", "i-2", None),
                    ],
                ),
                (
                    "eu-west-1".to_string(),
                    vec![instance("eu-west-1", "i-3", Some("Engineering"))],
                ),
            ]),
            delay: HashMap::new(),
            regions: vec!["eu-west-1".to_string(), "us-east-1".to_string()],
        };
        let scanner = scanner_with(fleet, 5, 30);
        let ctx = RequestContext::new();
        let aggregate = scanner.scan(&request(), &ctx).await;

        assert_eq!(aggregate.result.total_resources, 3);
        assert_eq!(aggregate.result.compliant_resources, 2);
        assert_eq!(aggregate.result.violations.len(), 1);
        assert_eq!(aggregate.region_metadata.successful_regions.len(), 2);
        assert!(aggregate.region_metadata.failed_regions.is_empty());

        // Per-region totals sum to the aggregate total
        let breakdown_total: usize = aggregate
            .region_breakdown
            .values()
            .map(|b| b.total_resources)
            .sum();
        assert_eq!(breakdown_total, aggregate.result.total_resources);
    }

    #[tokio::test]
    async fn timed_out_region_is_recorded_not_fatal() {
        let fleet = MockFleet {
            by_region: HashMap::from([
                (
                    "us-east-1".to_string(),
                    (1..=10)
                        .map(|i| {
                            let compliant = i <= 7;
                            instance(
                                "us-east-1",
                                &format!("i-{}", i),
                                compliant.then_some("Engineering"),
                            )
                        })
                        .collect(),
                ),
                (
                    "eu-west-1".to_string(),
                    vec![instance("eu-west-1", "i-x", Some("Engineering"))],
                ),
            ]),
            delay: HashMap::from([("eu-west-1".to_string(), Duration::from_secs(120))]),
            regions: vec!["eu-west-1".to_string(), "us-east-1".to_string()],
        };
        // Region timeout below the injected delay
        let scanner = scanner_with(fleet, 5, 10);

        tokio::time::pause();
        let ctx = RequestContext::new();
        let handle = tokio::spawn(async move { scanner.scan(&request(), &ctx).await });
        tokio::time::advance(Duration::from_secs(121)).await;
        let aggregate = handle.await.unwrap();

        assert_eq!(aggregate.result.total_resources, 10);
        assert_eq!(aggregate.result.compliant_resources, 7);
        assert!((aggregate.result.compliance_score - 0.7).abs() < f64::EPSILON);
        assert_eq!(
            aggregate.region_metadata.successful_regions,
            vec!["us-east-1"]
        );
        assert_eq!(aggregate.region_metadata.failed_regions.len(), 1);
        assert_eq!(aggregate.region_metadata.failed_regions[0].region, "eu-west-1");
        assert_eq!(aggregate.region_metadata.failed_regions[0].error, "timeout");
    }

    #[tokio::test]
    async fn serial_scan_equals_parallel_scan() {
        let build_fleet = || MockFleet {
            by_region: HashMap::from([
                (
                    "us-east-1".to_string(),
                    vec![instance("us-east-1", "i-1", None)],
                ),
                (
                    "eu-west-1".to_string(),
                    vec![instance("eu-west-1", "i-2", Some("Engineering"))],
                ),
                (
                    "ap-south-1".to_string(),
                    vec![instance("ap-south-1", "i-3", None)],
                ),
            ]),
            delay: HashMap::new(),
            regions: vec![
                "ap-south-1".to_string(),
                "eu-west-1".to_string(),
                "us-east-1".to_string(),
            ],
        };
        let ctx = RequestContext::new();

        let parallel = scanner_with(build_fleet(), 5, 30).scan(&request(), &ctx).await;
        let serial = scanner_with(build_fleet(), 1, 30).scan(&request(), &ctx).await;

        assert_eq!(
            parallel.result.total_resources,
            serial.result.total_resources
        );
        assert_eq!(
            parallel.result.compliant_resources,
            serial.result.compliant_resources
        );
        assert_eq!(parallel.result.compliance_score, serial.result.compliance_score);
        assert_eq!(parallel.region_breakdown.len(), serial.region_breakdown.len());
    }

    #[tokio::test]
    async fn global_types_ignore_region_filters() {
        let bucket = Resource {
            arn: "arn:aws:s3:::logs-bucket".to_string(),
            resource_type: "s3:bucket".to_string(),
            region: GLOBAL_REGION.to_string(),
            tags: HashMap::new(),
            created_at: None,
            state: None,
            instance_size: None,
        };
        let fleet = MockFleet {
            by_region: HashMap::from([("us-east-1".to_string(), vec![bucket])]),
            delay: HashMap::new(),
            regions: vec!["eu-west-1".to_string(), "us-east-1".to_string()],
        };
        let scanner = scanner_with(fleet, 5, 30);
        let ctx = RequestContext::new();
        let mut scan_request = request();
        scan_request.resource_types = vec!["s3:bucket".to_string()];
        // Region filter excludes every region; the global unit still runs
        scan_request.regions = Some(vec!["ap-northeast-3".to_string()]);

        let aggregate = scanner.scan(&scan_request, &ctx).await;
        assert_eq!(aggregate.result.total_resources, 1);
        assert!(aggregate.region_breakdown.contains_key(GLOBAL_REGION));
    }

    #[tokio::test]
    async fn empty_region_set_returns_clean_empty_aggregate() {
        let fleet = MockFleet {
            by_region: HashMap::new(),
            delay: HashMap::new(),
            regions: vec!["us-east-1".to_string()],
        };
        let scanner = scanner_with(fleet, 5, 30);
        let ctx = RequestContext::new();
        let mut scan_request = request();
        scan_request.regions = Some(vec!["nonexistent-1".to_string()]);

        let aggregate = scanner.scan(&scan_request, &ctx).await;
        assert_eq!(aggregate.result.total_resources, 0);
        assert!((aggregate.result.compliance_score - 1.0).abs() < f64::EPSILON);
        assert_eq!(aggregate.region_metadata.skipped_regions, vec!["us-east-1"]);
    }
}
