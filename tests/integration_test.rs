use async_trait::async_trait;
use finops_mcp::audit::{AuditQuery, AuditStore, InMemoryAuditStore};
use finops_mcp::cache::MemoryCacheBackend;
use finops_mcp::cloud::{CloudProvider, CostPeriod, ProviderFactory, Resource, ServiceCost};
use finops_mcp::config::Settings;
use finops_mcp::context::RequestContext;
use finops_mcp::error::Result;
use finops_mcp::history::InMemoryHistoryStore;
use finops_mcp::ServiceContainer;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

const EC2_SERVICE: &str = "Amazon Elastic Compute Cloud - Compute";

/// Canned provider fleet standing in for the cloud
struct MockFleet {
    by_region: HashMap<String, Vec<Resource>>,
    tags_by_arn: HashMap<String, HashMap<String, String>>,
    service_costs: Vec<ServiceCost>,
    regions: Vec<String>,
}

struct MockProvider {
    region: String,
    resources: Vec<Resource>,
    tags_by_arn: HashMap<String, HashMap<String, String>>,
    service_costs: Vec<ServiceCost>,
    regions: Vec<String>,
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn region(&self) -> &str {
        &self.region
    }

    async fn list_resources(&self, resource_type: &str) -> Result<Vec<Resource>> {
        Ok(self
            .resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect())
    }

    async fn get_tags_for_arns(
        &self,
        arns: &[String],
    ) -> Result<HashMap<String, HashMap<String, String>>> {
        Ok(arns
            .iter()
            .filter_map(|arn| {
                self.tags_by_arn
                    .get(arn)
                    .map(|tags| (arn.clone(), tags.clone()))
            })
            .collect())
    }

    async fn get_cost_by_service(&self, _period: &CostPeriod) -> Result<Vec<ServiceCost>> {
        Ok(self.service_costs.clone())
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
            tags_by_arn: self.tags_by_arn.clone(),
            service_costs: self.service_costs.clone(),
            regions: self.regions.clone(),
        }))
    }

    async fn cost_provider(&self) -> Result<Arc<dyn CloudProvider>> {
        self.provider_for("us-east-1").await
    }
}

fn instance(region: &str, id: &str, tags: &[(&str, &str)]) -> Resource {
    Resource {
        arn: format!("arn:aws:ec2:{}:123456789012:instance/{}", region, id),
        resource_type: "ec2:instance".to_string(),
        region: region.to_string(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        created_at: None,
        state: None,
        instance_size: None,
    }
}

const POLICY_JSON: &str = r#"{
    "version": "2024-06",
    "required_tags": [
        {
            "name": "CostCenter",
            "allowed_values": ["Engineering", "Marketing"],
            "applies_to": ["ec2:instance"]
        }
    ],
    "naming_rules": {"enabled": false}
}"#;

struct Harness {
    container: ServiceContainer,
    audit_store: Arc<InMemoryAuditStore>,
    _policy_dir: tempfile::TempDir,
}

async fn harness(fleet: MockFleet, configure: impl FnOnce(&mut Settings)) -> Harness {
    let policy_dir = tempfile::tempdir().unwrap();
    let policy_path = policy_dir.path().join("policy.json");
    std::fs::write(&policy_path, POLICY_JSON).unwrap();

    let mut settings = Settings::default();
    settings.policy_path = policy_path.to_string_lossy().to_string();
    configure(&mut settings);

    let audit_store = Arc::new(InMemoryAuditStore::new());
    let container = ServiceContainer::build_with(
        settings,
        Arc::new(fleet),
        audit_store.clone(),
        Arc::new(InMemoryHistoryStore::new()),
        Arc::new(MemoryCacheBackend::new()),
    )
    .await
    .unwrap();

    Harness {
        container,
        audit_store,
        _policy_dir: policy_dir,
    }
}

fn single_region_fleet() -> MockFleet {
    MockFleet {
        by_region: HashMap::from([(
            "eu-west-1".to_string(),
            vec![
                instance("eu-west-1", "i-1", &[("CostCenter", "Engineering")]),
                instance("eu-west-1", "i-2", &[("CostCenter", "eng")]),
            ],
        )]),
        tags_by_arn: HashMap::new(),
        service_costs: Vec::new(),
        regions: vec!["eu-west-1".to_string()],
    }
}

async fn call(harness: &Harness, tool: &str, arguments: Value) -> Value {
    let ctx = RequestContext::new();
    harness
        .container
        .dispatcher
        .dispatch(tool, arguments, &ctx)
        .await
}

#[tokio::test]
async fn compliance_scan_reports_invalid_value() {
    let harness = harness(single_region_fleet(), |_| {}).await;
    let envelope = call(
        &harness,
        "check_tag_compliance",
        json!({"resource_types": ["ec2:instance"]}),
    )
    .await;

    assert_eq!(envelope["status"], "ok");
    let result = &envelope["result"]["result"];
    assert_eq!(result["total_resources"], 2);
    assert_eq!(result["compliant_resources"], 1);
    assert!((result["compliance_score"].as_f64().unwrap() - 0.5).abs() < 1e-9);

    let violations = result["violations"].as_array().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0]["kind"], "invalid-value");
    assert_eq!(violations[0]["current_value"], "eng");
    assert_eq!(
        violations[0]["allowed_values"],
        json!(["Engineering", "Marketing"])
    );
}

#[tokio::test]
async fn severity_enum_accepts_single_element_array() {
    let harness = harness(single_region_fleet(), |_| {}).await;
    let envelope = call(
        &harness,
        "check_tag_compliance",
        json!({"resource_types": ["ec2:instance"], "severity": ["errors_only"]}),
    )
    .await;
    assert_eq!(envelope["status"], "ok");
}

#[tokio::test]
async fn identical_calls_hit_the_cache() {
    let harness = harness(single_region_fleet(), |_| {}).await;
    let arguments = json!({"resource_types": ["ec2:instance"]});

    let first = call(&harness, "check_tag_compliance", arguments.clone()).await;
    let second = call(&harness, "check_tag_compliance", arguments.clone()).await;
    // Identical results, including the scan timestamp, prove the cache hit
    assert_eq!(first["result"], second["result"]);

    let refreshed = call(
        &harness,
        "check_tag_compliance",
        json!({"resource_types": ["ec2:instance"], "force_refresh": true}),
    )
    .await;
    assert_eq!(refreshed["status"], "ok");
    assert_ne!(
        first["result"]["result"]["scanned_at"],
        refreshed["result"]["result"]["scanned_at"]
    );
}

#[tokio::test]
async fn injection_attempt_is_rejected_and_audited_without_payload() {
    let harness = harness(single_region_fleet(), |settings| {
        settings.guardrails.request_sanitization_enabled = true;
        settings.guardrails.security_monitoring_enabled = true;
    })
    .await;

    let payload = "'; DROP TABLE resources; --";
    let envelope = call(
        &harness,
        "check_tag_compliance",
        json!({"resource_types": [payload]}),
    )
    .await;

    assert_eq!(envelope["status"], "rejected");
    assert_eq!(envelope["message"], "Request rejected");

    let entries = harness
        .audit_store
        .query(&AuditQuery {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].parameters_json,
        "[redacted: security-violation/destructive-verb]"
    );
    assert!(!entries[0].parameters_json.contains(payload));
    assert_eq!(entries[0].status, finops_mcp::audit::AuditStatus::Failure);
}

#[tokio::test]
async fn every_call_produces_exactly_one_audit_entry() {
    let harness = harness(single_region_fleet(), |_| {}).await;

    call(
        &harness,
        "check_tag_compliance",
        json!({"resource_types": ["ec2:instance"]}),
    )
    .await;
    call(&harness, "get_tagging_policy", json!({})).await;
    call(&harness, "no_such_tool", json!({})).await;
    call(&harness, "check_tag_compliance", json!({"bogus": true})).await;

    let entries = harness
        .audit_store
        .query(&AuditQuery {
            limit: 50,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 4);
}

#[tokio::test]
async fn budget_guardrail_returns_structured_response() {
    let harness = harness(single_region_fleet(), |settings| {
        settings.guardrails.budget_tracking_enabled = true;
        settings.guardrails.max_tool_calls_per_session = 2;
    })
    .await;
    let ctx = RequestContext::with_correlation_id("corr").with_session("session-1");

    for _ in 0..2 {
        let envelope = harness
            .container
            .dispatcher
            .dispatch("get_tagging_policy", json!({}), &ctx)
            .await;
        assert_eq!(envelope["status"], "ok");
    }
    let envelope = harness
        .container
        .dispatcher
        .dispatch("get_tagging_policy", json!({}), &ctx)
        .await;
    assert_eq!(envelope["status"], "budget_exhausted");
    assert!(envelope["message"].as_str().unwrap().contains("2"));
}

#[tokio::test]
async fn loop_guardrail_blocks_identical_calls() {
    let harness = harness(single_region_fleet(), |settings| {
        settings.guardrails.loop_detection_enabled = true;
        settings.guardrails.max_identical_calls = 2;
    })
    .await;
    let ctx = RequestContext::with_correlation_id("corr").with_session("session-1");
    let arguments = json!({"resource_types": ["ec2:instance"]});

    for _ in 0..2 {
        let envelope = harness
            .container
            .dispatcher
            .dispatch("check_tag_compliance", arguments.clone(), &ctx)
            .await;
        assert_eq!(envelope["status"], "ok");
    }
    let envelope = harness
        .container
        .dispatcher
        .dispatch("check_tag_compliance", arguments.clone(), &ctx)
        .await;
    assert_eq!(envelope["status"], "loop_detected");
}

#[tokio::test]
async fn validate_resource_tags_checks_specific_arns() {
    let tagged = "arn:aws:ec2:eu-west-1:123456789012:instance/i-tagged";
    let untagged = "arn:aws:ec2:eu-west-1:123456789012:instance/i-untagged";
    let mut fleet = single_region_fleet();
    fleet.tags_by_arn = HashMap::from([
        (
            tagged.to_string(),
            HashMap::from([("CostCenter".to_string(), "Engineering".to_string())]),
        ),
        (untagged.to_string(), HashMap::new()),
    ]);

    let harness = harness(fleet, |_| {}).await;
    let envelope = call(
        &harness,
        "validate_resource_tags",
        json!({ "resource_arns": [tagged, untagged] }),
    )
    .await;

    assert_eq!(envelope["status"], "ok");
    let result = &envelope["result"];
    assert_eq!(result["total_resources"], 2);
    assert_eq!(result["compliant_resources"], 1);
    let violations = result["violations"].as_array().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0]["resource_id"], "i-untagged");
    assert_eq!(violations[0]["kind"], "missing-required-tag");
}

#[tokio::test]
async fn cost_attribution_gap_partitions_sum_to_total() {
    let mut svc = ServiceCost {
        service_name: EC2_SERVICE.to_string(),
        monthly_cost: 700.0,
        resource_costs: HashMap::new(),
    };
    svc.resource_costs.insert("i-tagged".to_string(), 580.0);
    svc.resource_costs.insert("i-untagged".to_string(), 120.0);

    let fleet = MockFleet {
        by_region: HashMap::from([(
            "eu-west-1".to_string(),
            vec![
                instance("eu-west-1", "i-tagged", &[("CostCenter", "Engineering")]),
                instance("eu-west-1", "i-untagged", &[]),
            ],
        )]),
        tags_by_arn: HashMap::new(),
        service_costs: vec![
            svc,
            ServiceCost {
                service_name: "AWS Support (Business)".to_string(),
                monthly_cost: 300.0,
                resource_costs: HashMap::new(),
            },
        ],
        regions: vec!["eu-west-1".to_string()],
    };

    let harness = harness(fleet, |settings| {
        // The policy only governs CostCenter; attribution follows the policy
        settings.cost_attribution_tags = vec!["CostCenter".to_string()];
    })
    .await;

    let envelope = call(
        &harness,
        "get_cost_attribution_gap",
        json!({"time_period": "last_30_days", "grouping": "by_resource_type"}),
    )
    .await;

    assert_eq!(envelope["status"], "ok");
    let gap = &envelope["result"]["gap"];
    assert!((gap["total_spend"].as_f64().unwrap() - 1000.0).abs() < 1e-9);
    assert!((gap["attributable_spend"].as_f64().unwrap() - 580.0).abs() < 1e-9);
    assert!((gap["gap"].as_f64().unwrap() - 420.0).abs() < 1e-9);
    assert!((gap["gap_pct"].as_f64().unwrap() - 0.42).abs() < 1e-9);

    let groups = gap["groups"].as_object().unwrap();
    let partition_sum: f64 = groups.values().map(|v| v.as_f64().unwrap()).sum();
    assert!((partition_sum - 420.0).abs() < 1e-9);
}

#[tokio::test]
async fn snapshots_feed_violation_history() {
    let harness = harness(single_region_fleet(), |_| {}).await;

    let envelope = call(
        &harness,
        "check_tag_compliance",
        json!({"resource_types": ["ec2:instance"], "store_snapshot": true}),
    )
    .await;
    assert_eq!(envelope["status"], "ok");

    let history = call(
        &harness,
        "get_violation_history",
        json!({"days_back": 7, "group_by": "day"}),
    )
    .await;
    assert_eq!(history["status"], "ok");
    let buckets = history["result"]["buckets"].as_array().unwrap();
    let total: u64 = buckets
        .iter()
        .map(|b| b["snapshot_count"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 1);
    assert_eq!(history["result"]["trend"], "stable");
}

#[tokio::test]
async fn find_untagged_resources_lists_missing_required() {
    let harness1 = harness(single_region_fleet(), |_| {}).await;
    let envelope = call(
        &harness1,
        "find_untagged_resources",
        json!({"resource_types": ["ec2:instance"]}),
    )
    .await;

    assert_eq!(envelope["status"], "ok");
    // i-1 is fully tagged and valid; i-2 has the tag present (value is wrong,
    // but not missing), so neither is untagged
    assert_eq!(envelope["result"]["total_untagged"], 0);

    let mut fleet = single_region_fleet();
    fleet
        .by_region
        .get_mut("eu-west-1")
        .unwrap()
        .push(instance("eu-west-1", "i-3", &[]));
    let harness = harness(fleet, |_| {}).await;
    let envelope = call(
        &harness,
        "find_untagged_resources",
        json!({"resource_types": ["ec2:instance"]}),
    )
    .await;
    assert_eq!(envelope["result"]["total_untagged"], 1);
    let untagged = envelope["result"]["untagged_resources"].as_array().unwrap();
    assert_eq!(untagged[0]["missing_tags"], json!(["CostCenter"]));
}

#[tokio::test]
async fn report_renders_markdown() {
    let harness = harness(single_region_fleet(), |_| {}).await;
    let envelope = call(
        &harness,
        "generate_compliance_report",
        json!({"format": "markdown", "include_recommendations": true}),
    )
    .await;

    assert_eq!(envelope["status"], "ok");
    let report = envelope["result"]["report"].as_str().unwrap();
    assert!(report.contains("# Tag Compliance Report"));
    assert!(report.contains("Compliance score"));
}

#[tokio::test]
async fn suggest_tags_uses_the_neighbourhood() {
    let mut fleet = single_region_fleet();
    let target = "arn:aws:ec2:eu-west-1:123456789012:instance/i-new";
    fleet.tags_by_arn.insert(target.to_string(), HashMap::new());
    // Neighbourhood: i-1 Engineering, i-2 eng; majority picks one of them
    fleet
        .by_region
        .get_mut("eu-west-1")
        .unwrap()
        .push(instance("eu-west-1", "i-3", &[("CostCenter", "Engineering")]));

    let harness = harness(fleet, |_| {}).await;
    let envelope = call(&harness, "suggest_tags", json!({ "resource_arn": target })).await;

    assert_eq!(envelope["status"], "ok");
    let suggestions = envelope["result"]["suggestions"].as_array().unwrap();
    let cost_center = suggestions
        .iter()
        .find(|s| s["tag_key"] == "CostCenter")
        .unwrap();
    assert_eq!(cost_center["suggested_value"], "Engineering");
    assert!(cost_center["confidence"].as_f64().unwrap() > 0.5);
    assert!(!cost_center["reasoning"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn tool_listing_covers_the_surface() {
    let harness = harness(single_region_fleet(), |_| {}).await;
    let tools = harness.container.dispatcher.list_tools();
    let names: Vec<&str> = tools
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    for expected in [
        "check_tag_compliance",
        "find_untagged_resources",
        "validate_resource_tags",
        "get_cost_attribution_gap",
        "suggest_tags",
        "get_tagging_policy",
        "generate_compliance_report",
        "get_violation_history",
    ] {
        assert!(names.contains(&expected), "missing tool {}", expected);
    }

    let info = harness.container.dispatcher.server_info().await;
    assert_eq!(info["policy_version"], "2024-06");
}
