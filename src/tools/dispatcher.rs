use crate::audit::{AuditService, AuditStatus, NewAuditEntry};
use crate::cache::{CacheKeyParams, ResultCache, COMPLIANCE_KEY_PREFIX};
use crate::catalog::ResourceTypeCatalog;
use crate::cloud::{parse_arn, CostPeriod, ProviderFactory, RegionDiscoverer, Resource, GLOBAL_REGION};
use crate::compliance::{ComplianceService, SeverityFilter, Violation};
use crate::config::Settings;
use crate::context::RequestContext;
use crate::cost::{CostService, GapGrouping};
use crate::error::{Error, Result};
use crate::history::{HistoryGroupBy, HistoryService, NewComplianceSnapshot};
use crate::policy::PolicyStore;
use crate::report::{self, ReportFormat};
use crate::scanner::{MultiRegionScanner, ScanRequest};
use crate::security::{
    self, canonical_json, BudgetDecision, BudgetTracker, InjectionDetector, InputSanitizer,
    LoopDecision, LoopDetector,
};
use crate::suggest::SuggestionService;
use crate::tools::ToolRegistry;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tagged outcome of one tool call, before it is rendered into a response
/// envelope. Guardrail rejections are values here, not errors.
#[derive(Debug)]
pub enum ToolOutcome {
    Ok(Value),
    BudgetExhausted { limit: u64 },
    LoopDetected { max_identical: u64 },
    ValidationError { field: String, reason: String },
    SecurityViolation { kind: String },
    Failed(Error),
}

/// The single public surface: validates, guards, routes, renders, audits.
///
/// Exactly one audit entry is appended per call, whatever the outcome. The
/// transports are pure framing adapters in front of this type.
pub struct Dispatcher {
    registry: ToolRegistry,
    settings: Settings,
    factory: Arc<dyn ProviderFactory>,
    scanner: Arc<MultiRegionScanner>,
    discoverer: Arc<RegionDiscoverer>,
    policy_store: Arc<PolicyStore>,
    catalog: Arc<ResourceTypeCatalog>,
    cost_service: Arc<CostService>,
    suggestions: Arc<SuggestionService>,
    audit: Arc<AuditService>,
    history: Arc<HistoryService>,
    result_cache: Arc<ResultCache>,
    budget: BudgetTracker,
    loop_detector: LoopDetector,
    sanitizer: InputSanitizer,
    injection: InjectionDetector,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        factory: Arc<dyn ProviderFactory>,
        scanner: Arc<MultiRegionScanner>,
        discoverer: Arc<RegionDiscoverer>,
        policy_store: Arc<PolicyStore>,
        catalog: Arc<ResourceTypeCatalog>,
        cost_service: Arc<CostService>,
        suggestions: Arc<SuggestionService>,
        audit: Arc<AuditService>,
        history: Arc<HistoryService>,
        result_cache: Arc<ResultCache>,
    ) -> Result<Self> {
        let backend = result_cache.backend();
        Ok(Self {
            registry: ToolRegistry::new()?,
            budget: BudgetTracker::new(backend.clone(), &settings.guardrails),
            loop_detector: LoopDetector::new(backend, &settings.guardrails),
            sanitizer: InputSanitizer::new(&settings.guardrails, settings.limits.clone()),
            injection: InjectionDetector::new(&settings.guardrails),
            settings,
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
        })
    }

    /// Tool listing for the transport handshake
    pub fn list_tools(&self) -> Vec<Value> {
        self.registry.list()
    }

    /// Server identity for the transport handshake
    pub async fn server_info(&self) -> Value {
        let policy = self.policy_store.current().await;
        json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "policy_version": policy.version,
            "guardrails": {
                "budget_tracking": self.settings.guardrails.budget_tracking_enabled,
                "loop_detection": self.settings.guardrails.loop_detection_enabled,
                "request_sanitization": self.settings.guardrails.request_sanitization_enabled,
            },
        })
    }

    /// Run one tool call end to end and return the response envelope
    pub async fn dispatch(&self, tool_name: &str, arguments: Value, ctx: &RequestContext) -> Value {
        let started = std::time::Instant::now();
        let outcome = self.run(tool_name, arguments.clone(), ctx).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        self.append_audit(tool_name, &arguments, &outcome, duration_ms, ctx)
            .await;
        self.render_envelope(tool_name, outcome, ctx)
    }

    async fn run(&self, tool_name: &str, mut arguments: Value, ctx: &RequestContext) -> ToolOutcome {
        let tool = match self.registry.get(tool_name) {
            Some(tool) => tool,
            None => {
                // Unknown names are a probe, not a typo worth detailing
                self.log_security_event("unknown-tool", ctx);
                return ToolOutcome::SecurityViolation {
                    kind: "unknown-tool".to_string(),
                };
            }
        };

        if let Err(kind) = self.sanitizer.check_arguments(&arguments) {
            self.log_security_event(kind, ctx);
            return ToolOutcome::SecurityViolation {
                kind: kind.to_string(),
            };
        }
        if let Some(kind) = self.injection.scan_arguments(&arguments) {
            self.log_security_event(kind, ctx);
            return ToolOutcome::SecurityViolation {
                kind: kind.to_string(),
            };
        }

        tool.auto_unwrap(&mut arguments);
        if let Err((field, reason)) = tool.validate(&arguments) {
            return ToolOutcome::ValidationError { field, reason };
        }

        if let BudgetDecision::Exhausted { limit } =
            self.budget.check_and_count(&ctx.session_id).await
        {
            return ToolOutcome::BudgetExhausted { limit };
        }
        if let LoopDecision::LoopDetected { max_identical } = self
            .loop_detector
            .check(&ctx.session_id, tool_name, &arguments)
            .await
        {
            return ToolOutcome::LoopDetected { max_identical };
        }

        match self.route(tool_name, arguments, ctx).await {
            Ok(result) => ToolOutcome::Ok(result),
            Err(Error::SecurityViolation(kind)) => {
                self.log_security_event(&kind, ctx);
                ToolOutcome::SecurityViolation { kind }
            }
            Err(Error::Validation(reason)) => ToolOutcome::ValidationError {
                field: "arguments".to_string(),
                reason,
            },
            Err(error) => ToolOutcome::Failed(error),
        }
    }

    async fn route(&self, tool_name: &str, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        match tool_name {
            "check_tag_compliance" => self.check_tag_compliance(arguments, ctx).await,
            "find_untagged_resources" => self.find_untagged_resources(arguments, ctx).await,
            "validate_resource_tags" => self.validate_resource_tags(arguments).await,
            "get_cost_attribution_gap" => self.get_cost_attribution_gap(arguments, ctx).await,
            "suggest_tags" => self.suggest_tags(arguments).await,
            "get_tagging_policy" => self.get_tagging_policy().await,
            "generate_compliance_report" => self.generate_compliance_report(arguments, ctx).await,
            "get_violation_history" => self.get_violation_history(arguments).await,
            "export_violations_csv" => self.export_violations_csv(arguments, ctx).await,
            "get_resource_types" => self.get_resource_types(),
            other => Err(Error::validation(format!("Unknown tool: {}", other))),
        }
    }

    // --- tool handlers -----------------------------------------------------

    async fn check_tag_compliance(&self, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            resource_types: Vec<String>,
            #[serde(default)]
            filters: BTreeMap<String, String>,
            #[serde(default)]
            severity: Option<String>,
            #[serde(default)]
            store_snapshot: bool,
            #[serde(default)]
            force_refresh: bool,
        }
        let args: Args = serde_json::from_value(arguments)?;
        let severity = parse_severity(args.severity.as_deref())?;

        let aggregate = self
            .run_compliance_scan(
                args.resource_types,
                args.filters,
                severity,
                None,
                args.force_refresh,
                ctx,
            )
            .await?;

        if args.store_snapshot {
            self.history
                .append(NewComplianceSnapshot::from_result(&aggregate.result))
                .await?;
        }

        Ok(serde_json::to_value(&aggregate)?)
    }

    async fn find_untagged_resources(&self, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            resource_types: Vec<String>,
            #[serde(default)]
            regions: Option<Vec<String>>,
            #[serde(default)]
            min_cost_threshold: Option<f64>,
        }
        let args: Args = serde_json::from_value(arguments)?;

        let request = ScanRequest {
            resource_types: args.resource_types,
            regions: args.regions,
            tag_filters: BTreeMap::new(),
            severity: SeverityFilter::All,
        };
        let (aggregate, resources) = self.scanner.scan_collecting(&request, ctx).await;
        let mut untagged = aggregate.untagged_resources;

        if let Some(threshold) = args.min_cost_threshold {
            // A cost threshold needs real cost data behind it
            let provider = self.factory.cost_provider().await?;
            let costs = provider
                .get_cost_by_service(&CostPeriod::last_days(30))
                .await?;
            let attribution = self.cost_service.attribute(&resources, &costs);
            let by_arn: HashMap<String, f64> = attribution
                .resource_costs
                .iter()
                .map(|c| (c.arn.clone(), c.monthly_cost))
                .collect();
            for entry in &mut untagged {
                entry.monthly_cost = by_arn.get(&entry.arn).copied().unwrap_or(0.0);
            }
            untagged.retain(|entry| entry.monthly_cost >= threshold);
        }

        Ok(json!({
            "total_untagged": untagged.len(),
            "untagged_resources": untagged,
            "region_metadata": aggregate.region_metadata,
        }))
    }

    async fn validate_resource_tags(&self, arguments: Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            resource_arns: Vec<String>,
        }
        let args: Args = serde_json::from_value(arguments)?;

        // Group by region; the tagging API answers per region
        let mut by_region: HashMap<String, Vec<String>> = HashMap::new();
        for arn in &args.resource_arns {
            let parts = parse_arn(arn)?;
            let region = if parts.region.is_empty() {
                self.settings.cloud.default_region.clone()
            } else {
                parts.region
            };
            by_region.entry(region).or_default().push(arn.clone());
        }

        let mut resources = Vec::with_capacity(args.resource_arns.len());
        for (region, arns) in by_region {
            let provider = self.factory.provider_for(&region).await?;
            let mut tag_map = provider.get_tags_for_arns(&arns).await?;
            for arn in arns {
                let parts = parse_arn(&arn)?;
                let resource_type = parts.type_string();
                let resource_region = if self.catalog.is_global(&resource_type) {
                    GLOBAL_REGION.to_string()
                } else {
                    region.clone()
                };
                resources.push(Resource {
                    tags: tag_map.remove(&arn).unwrap_or_default(),
                    arn,
                    resource_type,
                    region: resource_region,
                    created_at: None,
                    state: None,
                    instance_size: None,
                });
            }
        }

        let policy = self.policy_store.current().await;
        let result = ComplianceService::evaluate(&resources, &policy, SeverityFilter::All);
        Ok(serde_json::to_value(&result)?)
    }

    async fn get_cost_attribution_gap(&self, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            time_period: String,
            #[serde(default)]
            grouping: Option<String>,
        }
        let args: Args = serde_json::from_value(arguments)?;
        let period = parse_period(&args.time_period)?;
        let grouping = args.grouping.as_deref().map(parse_grouping).transpose()?;

        let request = ScanRequest {
            resource_types: self.catalog.all_applicable_types(),
            regions: None,
            tag_filters: BTreeMap::new(),
            severity: SeverityFilter::ErrorsOnly,
        };
        let (mut aggregate, resources) = self.scanner.scan_collecting(&request, ctx).await;

        let provider = self.factory.cost_provider().await?;
        let service_costs = provider.get_cost_by_service(&period).await?;
        let attribution = self.cost_service.attribute(&resources, &service_costs);

        let policy = self.policy_store.current().await;
        let gap = self
            .cost_service
            .attribution_gap(&resources, &attribution, &policy, grouping);

        // Cost was computed in this scan, so violations carry their
        // resource's monthly spend
        ComplianceService::attach_cost_impacts(
            &mut aggregate.result,
            &attribution.cost_by_resource_id(),
        );
        let mut costliest: Vec<&Violation> = aggregate
            .result
            .violations
            .iter()
            .filter(|v| v.monthly_cost_impact > 0.0)
            .collect();
        costliest.sort_by(|a, b| {
            b.monthly_cost_impact
                .partial_cmp(&a.monthly_cost_impact)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let costliest_violations: Vec<Violation> =
            costliest.into_iter().take(10).cloned().collect();

        Ok(json!({
            "gap": gap,
            "unattributable_services": attribution.unattributable,
            "costliest_violations": costliest_violations,
            "resources_considered": resources.len(),
            "region_metadata": aggregate.region_metadata,
        }))
    }

    async fn suggest_tags(&self, arguments: Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            resource_arn: String,
        }
        let args: Args = serde_json::from_value(arguments)?;
        let suggestions = self.suggestions.suggest_tags(&args.resource_arn).await?;
        Ok(json!({
            "resource_arn": args.resource_arn,
            "suggestions": suggestions,
        }))
    }

    async fn get_tagging_policy(&self) -> Result<Value> {
        let policy = self.policy_store.current().await;
        Ok(serde_json::to_value(policy.as_ref())?)
    }

    async fn generate_compliance_report(&self, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            format: String,
            #[serde(default)]
            include_recommendations: bool,
        }
        let args: Args = serde_json::from_value(arguments)?;
        let format = match args.format.as_str() {
            "json" => ReportFormat::Json,
            "csv" => ReportFormat::Csv,
            "markdown" => ReportFormat::Markdown,
            other => return Err(Error::validation(format!("Unknown report format: {}", other))),
        };

        let aggregate = self
            .run_compliance_scan(
                self.catalog.all_applicable_types(),
                BTreeMap::new(),
                SeverityFilter::All,
                None,
                false,
                ctx,
            )
            .await?;

        let rendered = report::render(&aggregate, format, args.include_recommendations);
        Ok(json!({
            "format": args.format,
            "report": rendered,
        }))
    }

    async fn get_violation_history(&self, arguments: Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            days_back: u32,
            #[serde(default)]
            group_by: Option<String>,
        }
        let args: Args = serde_json::from_value(arguments)?;
        let group_by = match args.group_by.as_deref() {
            None | Some("day") => HistoryGroupBy::Day,
            Some("week") => HistoryGroupBy::Week,
            Some("month") => HistoryGroupBy::Month,
            Some(other) => {
                return Err(Error::validation(format!("Unknown group_by: {}", other)))
            }
        };
        let history = self.history.get_history(args.days_back, group_by).await?;
        Ok(serde_json::to_value(&history)?)
    }

    async fn export_violations_csv(&self, arguments: Value, ctx: &RequestContext) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            resource_types: Vec<String>,
            #[serde(default)]
            severity: Option<String>,
        }
        let args: Args = serde_json::from_value(arguments)?;
        let severity = parse_severity(args.severity.as_deref())?;

        let aggregate = self
            .run_compliance_scan(args.resource_types, BTreeMap::new(), severity, None, false, ctx)
            .await?;
        Ok(json!({
            "format": "csv",
            "csv": report::render_csv(&aggregate.result.violations),
            "violation_count": aggregate.result.violations.len(),
        }))
    }

    fn get_resource_types(&self) -> Result<Value> {
        Ok(json!({
            "resource_types": self.catalog.entries(),
        }))
    }

    // --- shared plumbing ---------------------------------------------------

    /// The shared scan path behind the compliance tools, with the result
    /// cache in front. `force_refresh` bypasses the read but still
    /// repopulates the cache.
    async fn run_compliance_scan(
        &self,
        resource_types: Vec<String>,
        filters: BTreeMap<String, String>,
        severity: SeverityFilter,
        regions: Option<Vec<String>>,
        force_refresh: bool,
        ctx: &RequestContext,
    ) -> Result<crate::scanner::MultiRegionComplianceResult> {
        let discovery = self.discoverer.discover_enabled_regions().await;
        let effective = RegionDiscoverer::effective_regions(
            &discovery,
            &self.settings.cloud.allowed_regions,
            regions.as_deref(),
        );
        let policy = self.policy_store.current().await;
        let key = CacheKeyParams {
            cost_region: self.settings.cloud.cost_region.clone(),
            resource_types: resource_types.clone(),
            filters: filters.clone(),
            severity: severity.as_str().to_string(),
            regions: effective,
            policy_version: policy.version.clone(),
        }
        .key();

        if !force_refresh {
            if let Some(cached) = self.result_cache.get(&key).await {
                info!(correlation_id = %ctx.correlation_id, "Serving compliance result from cache");
                return Ok(cached);
            }
        }

        let request = ScanRequest {
            resource_types,
            regions,
            tag_filters: filters,
            severity,
        };
        let aggregate = self.scanner.scan(&request, ctx).await;
        self.result_cache
            .put_with_ttl(
                &key,
                &aggregate,
                Duration::from_secs(self.settings.cache.compliance_cache_ttl_seconds),
            )
            .await;
        Ok(aggregate)
    }

    /// Drop every cached compliance result; used by operators after policy
    /// reloads
    pub async fn invalidate_compliance_cache(&self) -> u64 {
        self.result_cache.invalidate(COMPLIANCE_KEY_PREFIX).await
    }

    fn log_security_event(&self, kind: &str, ctx: &RequestContext) {
        if self.settings.guardrails.security_monitoring_enabled {
            // The kind is logged; the payload never is
            warn!(
                correlation_id = %ctx.correlation_id,
                kind,
                "Security violation detected"
            );
        }
    }

    /// Exactly one audit entry per call, whatever the outcome. Parameters of
    /// security-violation calls are replaced with the violation kind.
    async fn append_audit(
        &self,
        tool_name: &str,
        arguments: &Value,
        outcome: &ToolOutcome,
        duration_ms: i64,
        ctx: &RequestContext,
    ) {
        let (status, parameters_json, error_message) = match outcome {
            ToolOutcome::Ok(_) => (AuditStatus::Success, canonical_json(arguments), None),
            ToolOutcome::SecurityViolation { kind } => (
                AuditStatus::Failure,
                format!("[redacted: security-violation/{}]", kind),
                Some("Request rejected".to_string()),
            ),
            ToolOutcome::BudgetExhausted { limit } => (
                AuditStatus::Failure,
                canonical_json(arguments),
                Some(format!("Budget exhausted (limit {})", limit)),
            ),
            ToolOutcome::LoopDetected { max_identical } => (
                AuditStatus::Failure,
                canonical_json(arguments),
                Some(format!("Loop detected (max {})", max_identical)),
            ),
            ToolOutcome::ValidationError { field, reason } => (
                AuditStatus::Failure,
                canonical_json(arguments),
                Some(format!("{}: {}", field, reason)),
            ),
            ToolOutcome::Failed(error) => (
                AuditStatus::Failure,
                canonical_json(arguments),
                Some(security::redact(&error.to_string())),
            ),
        };

        self.audit
            .record(NewAuditEntry {
                timestamp: Utc::now(),
                correlation_id: ctx.correlation_id.clone(),
                tool_name: tool_name.to_string(),
                parameters_json,
                status,
                execution_time_ms: duration_ms,
                error_message,
            })
            .await;
    }

    /// Map a tool outcome to the structured response envelope
    fn render_envelope(&self, tool_name: &str, outcome: ToolOutcome, ctx: &RequestContext) -> Value {
        let base = json!({
            "tool": tool_name,
            "correlation_id": ctx.correlation_id,
        });
        let mut envelope = base;
        match outcome {
            ToolOutcome::Ok(result) => {
                envelope["status"] = json!("ok");
                envelope["result"] = result;
            }
            ToolOutcome::BudgetExhausted { limit } => {
                envelope["status"] = json!("budget_exhausted");
                envelope["message"] = json!(format!(
                    "This session has used its budget of {} tool calls; wait for the session window to reset",
                    limit
                ));
            }
            ToolOutcome::LoopDetected { max_identical } => {
                envelope["status"] = json!("loop_detected");
                envelope["message"] = json!(format!(
                    "The same call was repeated more than {} times in a short window; change the arguments or wait",
                    max_identical
                ));
            }
            ToolOutcome::ValidationError { field, reason } => {
                envelope["status"] = json!("invalid_arguments");
                envelope["field"] = json!(field);
                envelope["message"] = json!(reason);
            }
            ToolOutcome::SecurityViolation { .. } => {
                // Generic by design; the payload is never echoed
                envelope["status"] = json!("rejected");
                envelope["message"] = json!("Request rejected");
            }
            ToolOutcome::Failed(error) => {
                envelope["status"] = json!("error");
                envelope["code"] = json!(error.kind());
                envelope["message"] = json!(security::user_safe_message(&error));
            }
        }
        envelope
    }
}

fn parse_severity(value: Option<&str>) -> Result<SeverityFilter> {
    match value {
        None | Some("all") => Ok(SeverityFilter::All),
        Some("errors_only") => Ok(SeverityFilter::ErrorsOnly),
        Some("warnings_only") => Ok(SeverityFilter::WarningsOnly),
        Some(other) => Err(Error::validation(format!("Unknown severity: {}", other))),
    }
}

fn parse_period(value: &str) -> Result<CostPeriod> {
    match value {
        "last_7_days" => Ok(CostPeriod::last_days(7)),
        "last_30_days" => Ok(CostPeriod::last_days(30)),
        "last_90_days" => Ok(CostPeriod::last_days(90)),
        other => Err(Error::validation(format!("Unknown time period: {}", other))),
    }
}

fn parse_grouping(value: &str) -> Result<GapGrouping> {
    match value {
        "by_resource_type" => Ok(GapGrouping::ByResourceType),
        "by_region" => Ok(GapGrouping::ByRegion),
        "by_account" => Ok(GapGrouping::ByAccount),
        other => Err(Error::validation(format!("Unknown grouping: {}", other))),
    }
}
