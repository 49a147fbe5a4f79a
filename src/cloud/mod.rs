/// Cloud access layer: the uniform resource model, the provider capability
/// trait, the region-bound AWS client, the memoising regional factory and the
/// region discoverer.
///
/// Everything above this module talks to the trait; nothing else knows how
/// resources are actually fetched.
pub mod aws;
pub mod factory;
pub mod regions;

pub use aws::AwsCliClient;
pub use factory::{ProviderFactory, RegionalClientFactory};
pub use regions::{RegionDiscoverer, RegionDiscovery};

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Synthetic region name for account-level resources
pub const GLOBAL_REGION: &str = "global";

/// Lifecycle state of a compute resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceState {
    Running,
    Pending,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown,
}

impl FromStr for ResourceState {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "running" | "available" => Ok(ResourceState::Running),
            "pending" | "starting" => Ok(ResourceState::Pending),
            "stopping" => Ok(ResourceState::Stopping),
            "stopped" => Ok(ResourceState::Stopped),
            "shutting-down" => Ok(ResourceState::ShuttingDown),
            "terminated" => Ok(ResourceState::Terminated),
            _ => Ok(ResourceState::Unknown),
        }
    }
}

impl ResourceState {
    /// Whether the resource currently accrues compute cost. Unknown states
    /// count as active so that cost is never silently dropped.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ResourceState::Running | ResourceState::Pending | ResourceState::Unknown
        )
    }

    /// Whether the resource is in a terminal or stopped state
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            ResourceState::Stopped
                | ResourceState::Stopping
                | ResourceState::ShuttingDown
                | ResourceState::Terminated
        )
    }
}

/// Uniform resource record returned by every provider call.
///
/// Created per call and discarded after the scan; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Amazon Resource Name
    pub arn: String,
    /// Canonical type string, `service:kind`
    pub resource_type: String,
    /// Region the resource lives in, or `"global"`
    pub region: String,
    /// Tags on the resource
    pub tags: HashMap<String, String>,
    /// Creation timestamp, when the discovery API reports one
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Lifecycle state for compute types
    #[serde(default)]
    pub state: Option<ResourceState>,
    /// Instance size for compute types (e.g. `m5.large`)
    #[serde(default)]
    pub instance_size: Option<String>,
}

impl Resource {
    /// Short resource id: the trailing component of the ARN
    pub fn resource_id(&self) -> &str {
        self.arn
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .unwrap_or(&self.arn)
    }

    /// The resource's Name tag, if present
    pub fn name_tag(&self) -> Option<&str> {
        self.tags.get("Name").map(|s| s.as_str())
    }
}

/// Monthly cost reported by the cost API for one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCost {
    /// Service name as the cost API reports it
    pub service_name: String,
    /// Total monthly cost for the service
    pub monthly_cost: f64,
    /// Per-resource amounts when the cost API offers resource granularity,
    /// keyed by resource id or Name tag
    #[serde(default)]
    pub resource_costs: HashMap<String, f64>,
}

/// Half-open date window a cost query covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl CostPeriod {
    /// Window ending today and starting `days` ago
    pub fn last_days(days: u32) -> Self {
        let end = Utc::now().date_naive();
        Self {
            start: end - chrono::Duration::days(days as i64),
            end,
        }
    }
}

/// Decomposed ARN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArnParts {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account_id: String,
    /// Resource kind when the ARN carries one (`instance` in
    /// `arn:aws:ec2:...:instance/i-0abc`)
    pub resource_kind: Option<String>,
    pub resource_id: String,
}

impl ArnParts {
    /// Canonical `service:kind` type string for this ARN
    pub fn type_string(&self) -> String {
        match &self.resource_kind {
            Some(kind) => format!("{}:{}", self.service, kind),
            None => match self.service.as_str() {
                // Services whose ARNs carry no explicit kind
                "s3" => "s3:bucket".to_string(),
                _ => self.service.clone(),
            },
        }
    }
}

/// Parse an ARN into its parts. Accepts the standard six-component shape
/// `arn:partition:service:region:account:resource`.
pub fn parse_arn(arn: &str) -> Result<ArnParts> {
    let mut parts = arn.splitn(6, ':');
    let prefix = parts.next().unwrap_or_default();
    if prefix != "arn" {
        return Err(Error::validation(format!("Not an ARN: {}", arn)));
    }
    let partition = parts.next().unwrap_or_default().to_string();
    let service = parts.next().unwrap_or_default().to_string();
    let region = parts.next().unwrap_or_default().to_string();
    let account_id = parts.next().unwrap_or_default().to_string();
    let resource = parts
        .next()
        .ok_or_else(|| Error::validation(format!("ARN missing resource part: {}", arn)))?;

    if service.is_empty() || resource.is_empty() {
        return Err(Error::validation(format!("Malformed ARN: {}", arn)));
    }

    let (resource_kind, resource_id) = match resource.split_once(|c| c == '/' || c == ':') {
        Some((kind, id)) => (Some(kind.to_string()), id.to_string()),
        None => (None, resource.to_string()),
    };

    Ok(ArnParts {
        partition,
        service,
        region,
        account_id,
        resource_kind,
        resource_id,
    })
}

/// Capability set every cloud provider must satisfy.
///
/// One implementation per region; the factory hands out region-bound
/// instances. All operations are read-only.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Region this provider is bound to
    fn region(&self) -> &str;

    /// List resources of one canonical type in this provider's region
    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>>;

    /// Batch tag lookup for known ARNs via the resource-groups tagging API,
    /// up to 100 ARNs per underlying call
    async fn get_tags_for_arns(
        &self,
        arns: &[String],
    ) -> Result<HashMap<String, HashMap<String, String>>>;

    /// Monthly cost per service over the period
    async fn get_cost_by_service(&self, period: &CostPeriod) -> Result<Vec<ServiceCost>>;

    /// Enabled regions for the account
    async fn describe_regions(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instance_arn() {
        let parts =
            parse_arn("arn:aws:ec2:eu-west-1:123456789012:instance/i-0abc123").unwrap();
        assert_eq!(parts.service, "ec2");
        assert_eq!(parts.region, "eu-west-1");
        assert_eq!(parts.account_id, "123456789012");
        assert_eq!(parts.resource_kind.as_deref(), Some("instance"));
        assert_eq!(parts.resource_id, "i-0abc123");
        assert_eq!(parts.type_string(), "ec2:instance");
    }

    #[test]
    fn parses_s3_arn_without_kind() {
        let parts = parse_arn("arn:aws:s3:::my-bucket").unwrap();
        assert_eq!(parts.type_string(), "s3:bucket");
        assert_eq!(parts.resource_id, "my-bucket");
        assert!(parts.region.is_empty());
    }

    #[test]
    fn rejects_non_arn() {
        assert!(parse_arn("i-0abc123").is_err());
        assert!(parse_arn("arn:aws:ec2").is_err());
    }

    #[test]
    fn state_classification() {
        assert!(ResourceState::Running.is_active());
        assert!(ResourceState::Pending.is_active());
        assert!(ResourceState::Unknown.is_active());
        assert!(ResourceState::Stopped.is_stopped());
        assert!(ResourceState::Terminated.is_stopped());
        assert!(ResourceState::ShuttingDown.is_stopped());
        assert_eq!("running".parse::<ResourceState>(), Ok(ResourceState::Running));
        assert_eq!("weird".parse::<ResourceState>(), Ok(ResourceState::Unknown));
    }

    #[test]
    fn resource_id_is_arn_tail() {
        let resource = Resource {
            arn: "arn:aws:ec2:eu-west-1:123456789012:instance/i-0abc".to_string(),
            resource_type: "ec2:instance".to_string(),
            region: "eu-west-1".to_string(),
            tags: HashMap::new(),
            created_at: None,
            state: None,
            instance_size: None,
        };
        assert_eq!(resource.resource_id(), "i-0abc");
    }
}
