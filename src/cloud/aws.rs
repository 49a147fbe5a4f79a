/// Region-bound AWS client.
///
/// Shells out to the AWS CLI and parses `--output json`, which keeps the
/// provider seam free of SDK types. Every call is rate-limited per service
/// and retried with exponential backoff on throttling.
use crate::cloud::{
    parse_arn, CloudProvider, CostPeriod, Resource, ResourceState, ServiceCost, GLOBAL_REGION,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::DateTime;
use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type ServiceLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Batch size limit of the resource-groups tagging API
const TAGGING_BATCH_SIZE: usize = 100;

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// AWS client bound to one region
pub struct AwsCliClient {
    region: String,
    /// Cost-explorer calls must go to this region. The cost API is only
    /// served from the well-known cost region, regardless of where the
    /// resources live.
    cost_region: String,
    profile: Option<String>,
    limiter: ServiceLimiter,
    account_id: OnceCell<String>,
}

impl AwsCliClient {
    /// Create a client for one region. `min_call_interval_ms` is the minimum
    /// spacing between calls to the same cloud service.
    pub fn new(
        region: impl Into<String>,
        cost_region: impl Into<String>,
        min_call_interval_ms: u64,
    ) -> Result<Self> {
        let interval = Duration::from_millis(min_call_interval_ms.max(1));
        let quota = Quota::with_period(interval)
            .ok_or_else(|| Error::config("min_call_interval_ms must be positive"))?;
        Ok(Self {
            region: region.into(),
            cost_region: cost_region.into(),
            profile: std::env::var("AWS_PROFILE").ok(),
            limiter: RateLimiter::keyed(quota),
            account_id: OnceCell::new(),
        })
    }

    /// Execute one AWS CLI call against a region, with per-service rate
    /// limiting and retry on throttling
    async fn execute(&self, region: &str, service: &str, args: &[&str]) -> Result<Value> {
        self.limiter.until_key_ready(&service.to_string()).await;

        let mut attempt = 0;
        loop {
            let mut cmd = Command::new("aws");
            cmd.args(["--region", region, "--output", "json"]);
            if let Some(ref profile) = self.profile {
                cmd.args(["--profile", profile]);
            }
            cmd.arg(service);
            cmd.args(args);

            let output = cmd
                .output()
                .await
                .map_err(|e| Error::cloud_api(format!("Failed to execute AWS CLI: {}", e)))?;

            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if stdout.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&stdout).map_err(|e| {
                    Error::parsing(format!("Failed to parse {} output: {}", service, e))
                });
            }

            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if attempt < MAX_RETRIES && is_retryable(&stderr) {
                let backoff = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_DELAY_MS);
                debug!(
                    service,
                    attempt, backoff_ms = backoff + jitter, "Retrying throttled AWS call"
                );
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                attempt += 1;
                continue;
            }

            return Err(Error::cloud_api(format!(
                "{} {} failed: {}",
                service,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
    }

    async fn execute_regional(&self, service: &str, args: &[&str]) -> Result<Value> {
        self.execute(&self.region, service, args).await
    }

    /// Account id via STS, fetched once and memoised
    async fn account_id(&self) -> Result<&str> {
        self.account_id
            .get_or_try_init(|| async {
                let value = self
                    .execute_regional("sts", &["get-caller-identity"])
                    .await?;
                value
                    .get("Account")
                    .and_then(|a| a.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| Error::cloud_api("STS response missing Account"))
            })
            .await
            .map(|s| s.as_str())
    }

    async fn list_ec2_instances(&self) -> Result<Vec<Resource>> {
        let value = self
            .execute_regional("ec2", &["describe-instances"])
            .await?;
        let account = self.account_id().await?.to_string();

        let mut resources = Vec::new();
        for reservation in value
            .get("Reservations")
            .and_then(|r| r.as_array())
            .unwrap_or(&Vec::new())
        {
            for instance in reservation
                .get("Instances")
                .and_then(|i| i.as_array())
                .unwrap_or(&Vec::new())
            {
                let instance_id = instance
                    .get("InstanceId")
                    .and_then(|i| i.as_str())
                    .unwrap_or_default();
                if instance_id.is_empty() {
                    continue;
                }
                let state = instance
                    .get("State")
                    .and_then(|s| s.get("Name"))
                    .and_then(|n| n.as_str())
                    .map(|s| ResourceState::from_str(s).unwrap_or(ResourceState::Unknown));
                resources.push(Resource {
                    arn: format!(
                        "arn:aws:ec2:{}:{}:instance/{}",
                        self.region, account, instance_id
                    ),
                    resource_type: "ec2:instance".to_string(),
                    region: self.region.clone(),
                    tags: parse_tag_array(instance.get("Tags")),
                    created_at: instance
                        .get("LaunchTime")
                        .and_then(|t| t.as_str())
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.to_utc()),
                    state,
                    instance_size: instance
                        .get("InstanceType")
                        .and_then(|t| t.as_str())
                        .map(|s| s.to_string()),
                });
            }
        }
        Ok(resources)
    }

    async fn list_rds_instances(&self) -> Result<Vec<Resource>> {
        let value = self
            .execute_regional("rds", &["describe-db-instances"])
            .await?;

        let mut resources = Vec::new();
        for db in value
            .get("DBInstances")
            .and_then(|d| d.as_array())
            .unwrap_or(&Vec::new())
        {
            let arn = db
                .get("DBInstanceArn")
                .and_then(|a| a.as_str())
                .unwrap_or_default();
            if arn.is_empty() {
                continue;
            }
            let state = db
                .get("DBInstanceStatus")
                .and_then(|s| s.as_str())
                .map(|s| ResourceState::from_str(s).unwrap_or(ResourceState::Unknown));
            resources.push(Resource {
                arn: arn.to_string(),
                resource_type: "rds:db".to_string(),
                region: self.region.clone(),
                tags: parse_tag_array(db.get("TagList")),
                created_at: db
                    .get("InstanceCreateTime")
                    .and_then(|t| t.as_str())
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.to_utc()),
                state,
                instance_size: db
                    .get("DBInstanceClass")
                    .and_then(|c| c.as_str())
                    .map(|s| s.to_string()),
            });
        }
        Ok(resources)
    }

    async fn list_lambda_functions(&self) -> Result<Vec<Resource>> {
        let value = self
            .execute_regional("lambda", &["list-functions"])
            .await?;

        let mut resources = Vec::new();
        for function in value
            .get("Functions")
            .and_then(|f| f.as_array())
            .unwrap_or(&Vec::new())
        {
            let arn = function
                .get("FunctionArn")
                .and_then(|a| a.as_str())
                .unwrap_or_default();
            if arn.is_empty() {
                continue;
            }
            resources.push(Resource {
                arn: arn.to_string(),
                resource_type: "lambda:function".to_string(),
                region: self.region.clone(),
                tags: HashMap::new(),
                created_at: None,
                state: None,
                instance_size: None,
            });
        }

        // list-functions does not return tags; resolve them in one batch
        let arns: Vec<String> = resources.iter().map(|r| r.arn.clone()).collect();
        if !arns.is_empty() {
            let tag_map = self.get_tags_for_arns(&arns).await?;
            for resource in &mut resources {
                if let Some(tags) = tag_map.get(&resource.arn) {
                    resource.tags = tags.clone();
                }
            }
        }
        Ok(resources)
    }

    /// Generic listing through the resource-groups tagging API. Returns ARN
    /// and tags for any taggable type; state and size stay unset.
    async fn list_via_tagging_api(&self, resource_type: &str) -> Result<Vec<Resource>> {
        let value = self
            .execute_regional(
                "resourcegroupstaggingapi",
                &["get-resources", "--resource-type-filters", resource_type],
            )
            .await?;

        let mut resources = Vec::new();
        for mapping in value
            .get("ResourceTagMappingList")
            .and_then(|l| l.as_array())
            .unwrap_or(&Vec::new())
        {
            let arn = mapping
                .get("ResourceARN")
                .and_then(|a| a.as_str())
                .unwrap_or_default();
            if arn.is_empty() {
                continue;
            }
            // ARNs of account-level resources carry no region
            let region = match parse_arn(arn) {
                Ok(parts) if parts.region.is_empty() => GLOBAL_REGION.to_string(),
                Ok(parts) => parts.region,
                Err(_) => self.region.clone(),
            };
            resources.push(Resource {
                arn: arn.to_string(),
                resource_type: resource_type.to_string(),
                region,
                tags: parse_tag_array(mapping.get("Tags")),
                created_at: None,
                state: None,
                instance_size: None,
            });
        }
        Ok(resources)
    }
}

#[async_trait]
impl CloudProvider for AwsCliClient {
    fn region(&self) -> &str {
        &self.region
    }

    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        match resource_type {
            "ec2:instance" => self.list_ec2_instances().await,
            "rds:db" => self.list_rds_instances().await,
            "lambda:function" => self.list_lambda_functions().await,
            other => self.list_via_tagging_api(other).await,
        }
    }

    async fn get_tags_for_arns(
        &self,
        arns: &[String],
    ) -> Result<HashMap<String, HashMap<String, String>>> {
        // The batch tagging API is the only correct way to resolve tags for a
        // known ARN: one call covers 100 ARNs, roughly 10x faster than
        // listing each service.
        let mut result = HashMap::with_capacity(arns.len());
        for chunk in arns.chunks(TAGGING_BATCH_SIZE) {
            let mut args: Vec<&str> = vec!["get-resources", "--resource-arn-list"];
            args.extend(chunk.iter().map(|s| s.as_str()));

            let value = self
                .execute_regional("resourcegroupstaggingapi", &args)
                .await?;
            for mapping in value
                .get("ResourceTagMappingList")
                .and_then(|l| l.as_array())
                .unwrap_or(&Vec::new())
            {
                if let Some(arn) = mapping.get("ResourceARN").and_then(|a| a.as_str()) {
                    result.insert(arn.to_string(), parse_tag_array(mapping.get("Tags")));
                }
            }
        }
        Ok(result)
    }

    async fn get_cost_by_service(&self, period: &CostPeriod) -> Result<Vec<ServiceCost>> {
        let time_period = format!(
            "Start={},End={}",
            period.start.format("%Y-%m-%d"),
            period.end.format("%Y-%m-%d")
        );
        // Cost Explorer is only served from the cost region; never use the
        // resource region here.
        let value = self
            .execute(
                &self.cost_region,
                "ce",
                &[
                    "get-cost-and-usage",
                    "--time-period",
                    &time_period,
                    "--granularity",
                    "MONTHLY",
                    "--metrics",
                    "UnblendedCost",
                    "--group-by",
                    "Type=DIMENSION,Key=SERVICE",
                ],
            )
            .await?;

        let mut totals: HashMap<String, f64> = HashMap::new();
        for bucket in value
            .get("ResultsByTime")
            .and_then(|r| r.as_array())
            .unwrap_or(&Vec::new())
        {
            for group in bucket
                .get("Groups")
                .and_then(|g| g.as_array())
                .unwrap_or(&Vec::new())
            {
                let service = group
                    .get("Keys")
                    .and_then(|k| k.as_array())
                    .and_then(|k| k.first())
                    .and_then(|k| k.as_str())
                    .unwrap_or_default();
                let amount = group
                    .get("Metrics")
                    .and_then(|m| m.get("UnblendedCost"))
                    .and_then(|c| c.get("Amount"))
                    .and_then(|a| a.as_str())
                    .and_then(|a| a.parse::<f64>().ok())
                    .unwrap_or(0.0);
                if !service.is_empty() {
                    *totals.entry(service.to_string()).or_insert(0.0) += amount;
                }
            }
        }

        let mut costs: Vec<ServiceCost> = totals
            .into_iter()
            .map(|(service_name, monthly_cost)| ServiceCost {
                service_name,
                monthly_cost,
                resource_costs: HashMap::new(),
            })
            .collect();
        costs.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        Ok(costs)
    }

    async fn describe_regions(&self) -> Result<Vec<String>> {
        let value = self.execute_regional("ec2", &["describe-regions"]).await?;
        let mut regions: Vec<String> = value
            .get("Regions")
            .and_then(|r| r.as_array())
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(|r| r.get("RegionName").and_then(|n| n.as_str()))
            .map(|s| s.to_string())
            .collect();
        regions.sort();
        if regions.is_empty() {
            warn!("describe-regions returned no regions");
        }
        Ok(regions)
    }
}

fn is_retryable(stderr: &str) -> bool {
    [
        "Throttling",
        "RequestLimitExceeded",
        "TooManyRequests",
        "Rate exceeded",
        "ServiceUnavailable",
        "InternalError",
        "InternalFailure",
        "HTTP 5",
    ]
    .iter()
    .any(|marker| stderr.contains(marker))
}

/// Parse the `[{"Key": .., "Value": ..}]` tag array shape shared by most
/// describe/list responses
fn parse_tag_array(value: Option<&Value>) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    if let Some(array) = value.and_then(|v| v.as_array()) {
        for tag in array {
            if let (Some(key), Some(value)) = (
                tag.get("Key").and_then(|k| k.as_str()),
                tag.get("Value").and_then(|v| v.as_str()),
            ) {
                tags.insert(key.to_string(), value.to_string());
            }
        }
    }
    tags
}
