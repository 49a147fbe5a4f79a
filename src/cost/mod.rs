use crate::catalog::{ResourceCategory, ResourceTypeCatalog};
use crate::cloud::{Resource, ServiceCost};
use crate::policy::TagPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where a per-resource cost figure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostSource {
    /// The cost API reported this resource directly
    Actual,
    /// Distributed from a service total
    Estimated,
    /// Stopped compute; no compute cost assigned
    Stopped,
}

/// Monthly cost assigned to one resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCost {
    pub arn: String,
    pub resource_id: String,
    pub resource_type: String,
    pub region: String,
    pub monthly_cost: f64,
    pub cost_source: CostSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Service spend that cannot be assigned to a single resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnattributableSpend {
    pub service_name: String,
    pub monthly_cost: f64,
}

/// Full attribution of one cost period over one scanned resource set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAttribution {
    pub resource_costs: Vec<ResourceCost>,
    pub unattributable: Vec<UnattributableSpend>,
    /// Sum of every cost series over the period
    pub total_spend: f64,
}

impl CostAttribution {
    /// Per-resource monthly cost keyed by short resource id
    pub fn cost_by_resource_id(&self) -> HashMap<String, f64> {
        self.resource_costs
            .iter()
            .map(|c| (c.resource_id.clone(), c.monthly_cost))
            .collect()
    }

    /// Whether every assigned per-resource cost is exactly zero, the typical
    /// outcome of a tag-API-only scan
    pub fn all_zero(&self) -> bool {
        self.resource_costs.iter().all(|c| c.monthly_cost == 0.0)
    }
}

/// Cost-attribution gap for a period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAttributionGap {
    pub total_spend: f64,
    pub attributable_spend: f64,
    pub gap: f64,
    pub gap_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping: Option<String>,
    /// Partition of the gap; values sum to `gap`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<HashMap<String, f64>>,
}

/// How a gap partition is keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapGrouping {
    ByResourceType,
    ByRegion,
    ByAccount,
}

impl GapGrouping {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapGrouping::ByResourceType => "by_resource_type",
            GapGrouping::ByRegion => "by_region",
            GapGrouping::ByAccount => "by_account",
        }
    }
}

/// Relative hourly weight of an instance size, used when distributing a
/// service total over a mixed fleet
#[derive(Debug, Clone)]
pub struct InstanceSizeWeights {
    table: HashMap<String, f64>,
}

impl Default for InstanceSizeWeights {
    fn default() -> Self {
        let table = [
            ("nano", 0.25),
            ("micro", 0.5),
            ("small", 1.0),
            ("medium", 2.0),
            ("large", 4.0),
            ("xlarge", 8.0),
            ("2xlarge", 16.0),
            ("4xlarge", 32.0),
            ("8xlarge", 64.0),
            ("12xlarge", 96.0),
            ("16xlarge", 128.0),
            ("24xlarge", 192.0),
            ("metal", 192.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { table }
    }
}

impl InstanceSizeWeights {
    /// Weight for an instance size like `m5.large`; unknown sizes weigh 1.0
    pub fn weight(&self, instance_size: Option<&str>) -> f64 {
        instance_size
            .and_then(|size| size.rsplit('.').next())
            .and_then(|suffix| self.table.get(suffix))
            .copied()
            .unwrap_or(1.0)
    }
}

/// How a service's total is spread over its resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DistributionClass {
    /// State-aware three-tier distribution
    Compute,
    /// Actuals first, remainder split evenly
    PerResource,
    /// Even split across every visible resource
    ServiceLevel,
}

fn distribution_class(resource_type: &str) -> DistributionClass {
    match resource_type {
        "ec2:instance" => DistributionClass::Compute,
        "rds:db" => DistributionClass::PerResource,
        _ => DistributionClass::ServiceLevel,
    }
}

/// Computes per-resource monthly cost and the cost-attribution gap.
///
/// Monetary arithmetic keeps full precision throughout; rounding happens only
/// when a report is rendered.
pub struct CostService {
    catalog: Arc<ResourceTypeCatalog>,
    weights: InstanceSizeWeights,
    attribution_tags: Vec<String>,
}

impl CostService {
    pub fn new(
        catalog: Arc<ResourceTypeCatalog>,
        weights: InstanceSizeWeights,
        attribution_tags: Vec<String>,
    ) -> Self {
        Self {
            catalog,
            weights,
            attribution_tags,
        }
    }

    /// Assign a monthly cost to every resource from the service cost series
    pub fn attribute(
        &self,
        resources: &[Resource],
        service_costs: &[ServiceCost],
    ) -> CostAttribution {
        let total_spend: f64 = service_costs.iter().map(|s| s.monthly_cost).sum();

        // Resources grouped by the service their type bills under
        let mut by_service: HashMap<&str, Vec<&Resource>> = HashMap::new();
        for resource in resources {
            if self.catalog.category(&resource.resource_type)
                == Some(ResourceCategory::Unattributable)
            {
                continue;
            }
            if let Some(service) = self.catalog.cost_service_name(&resource.resource_type) {
                by_service.entry(service).or_default().push(resource);
            }
        }

        let mut resource_costs = Vec::with_capacity(resources.len());
        let mut unattributable = Vec::new();

        for service in service_costs {
            match by_service.get(service.service_name.as_str()) {
                Some(members) if !members.is_empty() => {
                    self.distribute_service(service, members, &mut resource_costs);
                }
                _ => {
                    // Spend with no visible resource behind it stays in its
                    // own bucket instead of being smeared over the fleet
                    if service.monthly_cost > 0.0 {
                        unattributable.push(UnattributableSpend {
                            service_name: service.service_name.clone(),
                            monthly_cost: service.monthly_cost,
                        });
                    }
                }
            }
        }

        // Resources whose service reported no spend still appear, at zero
        let seen: std::collections::HashSet<String> = resource_costs
            .iter()
            .map(|c| c.arn.clone())
            .collect();
        for resource in resources {
            if self.catalog.category(&resource.resource_type)
                == Some(ResourceCategory::Unattributable)
            {
                continue;
            }
            if !seen.contains(resource.arn.as_str()) {
                resource_costs.push(ResourceCost {
                    arn: resource.arn.clone(),
                    resource_id: resource.resource_id().to_string(),
                    resource_type: resource.resource_type.clone(),
                    region: resource.region.clone(),
                    monthly_cost: 0.0,
                    cost_source: CostSource::Estimated,
                    note: None,
                });
            }
        }

        resource_costs.sort_by(|a, b| a.arn.cmp(&b.arn));
        unattributable.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        CostAttribution {
            resource_costs,
            unattributable,
            total_spend,
        }
    }

    fn distribute_service(
        &self,
        service: &ServiceCost,
        members: &[&Resource],
        out: &mut Vec<ResourceCost>,
    ) {
        // All members of one service share a type family; classify by the
        // first member
        let class = distribution_class(&members[0].resource_type);

        // Tier 1: per-resource amounts reported by the cost API, matched by
        // Name tag or resource id
        let mut actuals: HashMap<&str, f64> = HashMap::new();
        for resource in members {
            let by_name = resource
                .name_tag()
                .and_then(|name| service.resource_costs.get(name));
            let by_id = service.resource_costs.get(resource.resource_id());
            if let Some(amount) = by_name.or(by_id) {
                actuals.insert(resource.arn.as_str(), *amount);
            }
        }
        let actual_total: f64 = actuals.values().sum();
        let remaining = (service.monthly_cost - actual_total).max(0.0);

        match class {
            DistributionClass::Compute => {
                self.distribute_compute(service, members, &actuals, remaining, out)
            }
            DistributionClass::PerResource => {
                let without_actual: Vec<&&Resource> = members
                    .iter()
                    .filter(|r| !actuals.contains_key(r.arn.as_str()))
                    .collect();
                let share = if without_actual.is_empty() {
                    0.0
                } else {
                    remaining / without_actual.len() as f64
                };
                for resource in members {
                    match actuals.get(resource.arn.as_str()) {
                        Some(amount) => out.push(self.cost_entry(
                            resource,
                            *amount,
                            CostSource::Actual,
                            None,
                        )),
                        None => out.push(self.cost_entry(
                            resource,
                            share,
                            CostSource::Estimated,
                            None,
                        )),
                    }
                }
            }
            DistributionClass::ServiceLevel => {
                // Even split across every visible resource of the service
                let share = service.monthly_cost / members.len() as f64;
                for resource in members {
                    out.push(self.cost_entry(resource, share, CostSource::Estimated, None));
                }
            }
        }
    }

    /// Tiers 2 and 3 for compute fleets
    fn distribute_compute(
        &self,
        service: &ServiceCost,
        members: &[&Resource],
        actuals: &HashMap<&str, f64>,
        remaining: f64,
        out: &mut Vec<ResourceCost>,
    ) {
        let mut active: Vec<&&Resource> = Vec::new();
        let mut stopped: Vec<&&Resource> = Vec::new();
        for resource in members {
            if actuals.contains_key(resource.arn.as_str()) {
                continue;
            }
            // Unknown and missing states land in the active pool so cost is
            // never silently dropped
            let is_stopped = resource.state.map(|s| s.is_stopped()).unwrap_or(false);
            if is_stopped {
                stopped.push(resource);
            } else {
                active.push(resource);
            }
        }

        for resource in members {
            if let Some(amount) = actuals.get(resource.arn.as_str()) {
                out.push(self.cost_entry(resource, *amount, CostSource::Actual, None));
            }
        }

        if !active.is_empty() {
            // Tier 2: spread the remainder over the active pool by size
            let total_weight: f64 = active
                .iter()
                .map(|r| self.weights.weight(r.instance_size.as_deref()))
                .sum();
            for resource in &active {
                let weight = self.weights.weight(resource.instance_size.as_deref());
                let amount = if total_weight > 0.0 {
                    remaining * weight / total_weight
                } else {
                    0.0
                };
                out.push(self.cost_entry(resource, amount, CostSource::Estimated, None));
            }
            for resource in &stopped {
                // Compute cost only; storage costs are tracked separately
                out.push(self.cost_entry(resource, 0.0, CostSource::Stopped, None));
            }
        } else if remaining > 0.0 && !stopped.is_empty() {
            // Tier 3: nothing is running yet the service still billed;
            // spread over everything rather than lose the spend
            debug!(
                service = %service.service_name,
                remaining, "No active instances; falling back to proportional distribution"
            );
            let total_weight: f64 = stopped
                .iter()
                .map(|r| self.weights.weight(r.instance_size.as_deref()))
                .sum();
            for resource in &stopped {
                let weight = self.weights.weight(resource.instance_size.as_deref());
                let amount = if total_weight > 0.0 {
                    remaining * weight / total_weight
                } else {
                    0.0
                };
                out.push(self.cost_entry(
                    resource,
                    amount,
                    CostSource::Estimated,
                    Some(
                        "likely incomplete cost data or non-instance charges such as NAT, EBS"
                            .to_string(),
                    ),
                ));
            }
        } else {
            for resource in &stopped {
                // Compute cost only; storage costs are tracked separately
                out.push(self.cost_entry(resource, 0.0, CostSource::Stopped, None));
            }
        }
    }

    fn cost_entry(
        &self,
        resource: &Resource,
        monthly_cost: f64,
        cost_source: CostSource,
        note: Option<String>,
    ) -> ResourceCost {
        ResourceCost {
            arn: resource.arn.clone(),
            resource_id: resource.resource_id().to_string(),
            resource_type: resource.resource_type.clone(),
            region: resource.region.clone(),
            monthly_cost,
            cost_source,
            note,
        }
    }

    /// Whether a resource carries every cost-attribution tag that applies to
    /// its type, with values the policy accepts
    pub fn is_attributable(&self, resource: &Resource, policy: &TagPolicy) -> bool {
        for required in policy.required_tags_for(&resource.resource_type) {
            if !self.attribution_tags.contains(&required.name) {
                continue;
            }
            match resource.tags.get(&required.name) {
                None => return false,
                Some(value) => {
                    if let Some(allowed) = &required.allowed_values {
                        if !allowed.contains(value) {
                            return false;
                        }
                    }
                    if let Some(pattern) = required.regex() {
                        if !pattern.is_match(value) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Compute the cost-attribution gap over an attributed resource set
    pub fn attribution_gap(
        &self,
        resources: &[Resource],
        attribution: &CostAttribution,
        policy: &TagPolicy,
        grouping: Option<GapGrouping>,
    ) -> CostAttributionGap {
        let by_arn: HashMap<&str, &Resource> =
            resources.iter().map(|r| (r.arn.as_str(), r)).collect();

        let mut attributable_spend = 0.0;
        // Gap contributions per resource, for the optional partition
        let mut gap_entries: Vec<(&ResourceCost, f64)> = Vec::new();
        for cost in &attribution.resource_costs {
            let attributable = by_arn
                .get(cost.arn.as_str())
                .map(|r| self.is_attributable(r, policy))
                .unwrap_or(false);
            if attributable {
                attributable_spend += cost.monthly_cost;
            } else {
                gap_entries.push((cost, cost.monthly_cost));
            }
        }

        let gap = attribution.total_spend - attributable_spend;
        let gap_pct = if attribution.total_spend > 0.0 {
            gap / attribution.total_spend
        } else {
            0.0
        };

        let groups = grouping.map(|g| {
            let mut partition: HashMap<String, f64> = HashMap::new();
            let mut assigned = 0.0;
            for (cost, amount) in &gap_entries {
                let key = match g {
                    GapGrouping::ByResourceType => cost.resource_type.clone(),
                    GapGrouping::ByRegion => cost.region.clone(),
                    GapGrouping::ByAccount => crate::cloud::parse_arn(&cost.arn)
                        .map(|p| p.account_id)
                        .unwrap_or_else(|_| "unknown".to_string()),
                };
                *partition.entry(key).or_insert(0.0) += amount;
                assigned += amount;
            }
            // Spend never assigned to any resource closes the partition so
            // the group sum equals the total gap
            let unallocated = gap - assigned;
            if unallocated.abs() > f64::EPSILON {
                *partition.entry("unallocated".to_string()).or_insert(0.0) += unallocated;
            }
            partition
        });

        CostAttributionGap {
            total_spend: attribution.total_spend,
            attributable_spend,
            gap,
            gap_pct,
            grouping: grouping.map(|g| g.as_str().to_string()),
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ResourceState;

    fn service(name: &str, total: f64) -> ServiceCost {
        ServiceCost {
            service_name: name.to_string(),
            monthly_cost: total,
            resource_costs: HashMap::new(),
        }
    }

    fn instance(id: &str, state: ResourceState, size: &str, tags: &[(&str, &str)]) -> Resource {
        Resource {
            arn: format!("arn:aws:ec2:eu-west-1:123456789012:instance/{}", id),
            resource_type: "ec2:instance".to_string(),
            region: "eu-west-1".to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: None,
            state: Some(state),
            instance_size: Some(size.to_string()),
        }
    }

    fn cost_service() -> CostService {
        CostService::new(
            Arc::new(ResourceTypeCatalog::builtin()),
            InstanceSizeWeights::default(),
            vec![
                "CostCenter".to_string(),
                "Owner".to_string(),
                "Environment".to_string(),
            ],
        )
    }

    const EC2_SERVICE: &str = "Amazon Elastic Compute Cloud - Compute";

    #[test]
    fn state_aware_distribution() {
        // Three instances, $300 service total, no per-resource data:
        // both running instances get $150, the stopped one gets $0
        let resources = vec![
            instance("i-1", ResourceState::Running, "m5.large", &[]),
            instance("i-2", ResourceState::Running, "m5.large", &[]),
            instance("i-3", ResourceState::Stopped, "m5.large", &[]),
        ];
        let costs = vec![service(EC2_SERVICE, 300.0)];
        let attribution = cost_service().attribute(&resources, &costs);

        let by_id = attribution.cost_by_resource_id();
        assert!((by_id["i-1"] - 150.0).abs() < 1e-9);
        assert!((by_id["i-2"] - 150.0).abs() < 1e-9);
        assert_eq!(by_id["i-3"], 0.0);

        let stopped = attribution
            .resource_costs
            .iter()
            .find(|c| c.resource_id == "i-3")
            .unwrap();
        assert_eq!(stopped.cost_source, CostSource::Stopped);
        let running = attribution
            .resource_costs
            .iter()
            .find(|c| c.resource_id == "i-1")
            .unwrap();
        assert_eq!(running.cost_source, CostSource::Estimated);
    }

    #[test]
    fn size_weights_shape_the_distribution() {
        let resources = vec![
            instance("i-big", ResourceState::Running, "m5.xlarge", &[]),
            instance("i-small", ResourceState::Running, "m5.large", &[]),
        ];
        let costs = vec![service(EC2_SERVICE, 120.0)];
        let attribution = cost_service().attribute(&resources, &costs);
        let by_id = attribution.cost_by_resource_id();
        // xlarge carries twice the weight of large
        assert!((by_id["i-big"] - 80.0).abs() < 1e-9);
        assert!((by_id["i-small"] - 40.0).abs() < 1e-9);
    }

    #[test]
    fn actuals_take_precedence() {
        let mut svc = service(EC2_SERVICE, 100.0);
        svc.resource_costs.insert("i-1".to_string(), 70.0);
        let resources = vec![
            instance("i-1", ResourceState::Running, "m5.large", &[]),
            instance("i-2", ResourceState::Running, "m5.large", &[]),
        ];
        let attribution = cost_service().attribute(&resources, &[svc]);
        let by_id = attribution.cost_by_resource_id();
        assert!((by_id["i-1"] - 70.0).abs() < 1e-9);
        assert!((by_id["i-2"] - 30.0).abs() < 1e-9);

        let actual = attribution
            .resource_costs
            .iter()
            .find(|c| c.resource_id == "i-1")
            .unwrap();
        assert_eq!(actual.cost_source, CostSource::Actual);
    }

    #[test]
    fn proportional_fallback_when_everything_is_stopped() {
        let resources = vec![
            instance("i-1", ResourceState::Stopped, "m5.large", &[]),
            instance("i-2", ResourceState::Terminated, "m5.large", &[]),
        ];
        let costs = vec![service(EC2_SERVICE, 50.0)];
        let attribution = cost_service().attribute(&resources, &costs);
        let by_id = attribution.cost_by_resource_id();
        assert!((by_id["i-1"] - 25.0).abs() < 1e-9);
        assert!((by_id["i-2"] - 25.0).abs() < 1e-9);
        for cost in &attribution.resource_costs {
            assert_eq!(cost.cost_source, CostSource::Estimated);
            assert!(cost.note.as_ref().unwrap().contains("incomplete cost data"));
        }
    }

    #[test]
    fn unknown_state_is_conservatively_active() {
        let resources = vec![
            instance("i-u", ResourceState::Unknown, "m5.large", &[]),
            instance("i-s", ResourceState::Stopped, "m5.large", &[]),
        ];
        let costs = vec![service(EC2_SERVICE, 90.0)];
        let attribution = cost_service().attribute(&resources, &costs);
        let by_id = attribution.cost_by_resource_id();
        assert!((by_id["i-u"] - 90.0).abs() < 1e-9);
        assert_eq!(by_id["i-s"], 0.0);
    }

    #[test]
    fn service_spend_without_resources_is_unattributable() {
        let resources = vec![instance("i-1", ResourceState::Running, "m5.large", &[])];
        let costs = vec![
            service(EC2_SERVICE, 10.0),
            service("AWS Support (Business)", 29.0),
        ];
        let attribution = cost_service().attribute(&resources, &costs);
        assert_eq!(attribution.unattributable.len(), 1);
        assert_eq!(
            attribution.unattributable[0].service_name,
            "AWS Support (Business)"
        );
        assert!((attribution.total_spend - 39.0).abs() < 1e-9);
    }

    fn gap_policy() -> TagPolicy {
        TagPolicy::from_str(
            r#"{
                "version": "1",
                "required_tags": [
                    {"name": "CostCenter", "allowed_values": ["Engineering", "Marketing"]},
                    {"name": "Owner"}
                ],
                "naming_rules": {"enabled": false}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn gap_arithmetic_and_grouping_partition() {
        // $1000 total: $580 on a fully tagged instance, $120 on an untagged
        // one, $300 never lands on a resource
        let tagged = instance(
            "i-tagged",
            ResourceState::Running,
            "m5.large",
            &[("CostCenter", "Engineering"), ("Owner", "team-a")],
        );
        let untagged = instance("i-untagged", ResourceState::Running, "m5.large", &[]);
        let resources = vec![tagged, untagged];

        let mut svc = service(EC2_SERVICE, 700.0);
        svc.resource_costs.insert("i-tagged".to_string(), 580.0);
        svc.resource_costs.insert("i-untagged".to_string(), 120.0);
        let costs = vec![svc, service("AWS Support (Business)", 300.0)];

        let service_under_test = cost_service();
        let attribution = service_under_test.attribute(&resources, &costs);
        let gap = service_under_test.attribution_gap(
            &resources,
            &attribution,
            &gap_policy(),
            Some(GapGrouping::ByResourceType),
        );

        assert!((gap.total_spend - 1000.0).abs() < 1e-9);
        assert!((gap.attributable_spend - 580.0).abs() < 1e-9);
        assert!((gap.gap - 420.0).abs() < 1e-9);
        assert!((gap.gap_pct - 0.42).abs() < 1e-9);

        let groups = gap.groups.unwrap();
        let partition_sum: f64 = groups.values().sum();
        assert!((partition_sum - 420.0).abs() < 1e-9);
        assert!((groups["ec2:instance"] - 120.0).abs() < 1e-9);
        assert!((groups["unallocated"] - 300.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_attribution_value_is_not_attributable() {
        let service_under_test = cost_service();
        let policy = gap_policy();
        let bad_value = instance(
            "i-1",
            ResourceState::Running,
            "m5.large",
            &[("CostCenter", "eng"), ("Owner", "team-a")],
        );
        assert!(!service_under_test.is_attributable(&bad_value, &policy));

        let good = instance(
            "i-2",
            ResourceState::Running,
            "m5.large",
            &[("CostCenter", "Engineering"), ("Owner", "team-a")],
        );
        assert!(service_under_test.is_attributable(&good, &policy));
    }

    #[test]
    fn zero_detection_for_tag_only_scans() {
        let resources = vec![instance("i-1", ResourceState::Running, "m5.large", &[])];
        let attribution = cost_service().attribute(&resources, &[]);
        assert!(attribution.all_zero());
    }
}
