use crate::cloud::Resource;
use crate::policy::{TagCase, TagPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Violation severity. Only error-severity violations affect the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn rank(self) -> u8 {
        match self {
            Severity::Error => 0,
            Severity::Warning => 1,
        }
    }
}

/// What went wrong with a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    MissingRequiredTag,
    InvalidValue,
    InvalidFormat,
}

/// Which violations a caller wants to see. The compliance score ignores this
/// filter and always uses the error-severity definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeverityFilter {
    ErrorsOnly,
    WarningsOnly,
    #[default]
    All,
}

impl SeverityFilter {
    pub fn includes(&self, severity: Severity) -> bool {
        match self {
            SeverityFilter::ErrorsOnly => severity == Severity::Error,
            SeverityFilter::WarningsOnly => severity == Severity::Warning,
            SeverityFilter::All => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityFilter::ErrorsOnly => "errors_only",
            SeverityFilter::WarningsOnly => "warnings_only",
            SeverityFilter::All => "all",
        }
    }
}

/// A single policy violation on one scanned resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Short id of the offending resource
    pub resource_id: String,
    /// Canonical resource type
    pub resource_type: String,
    /// Region the resource was scanned in
    pub region: String,
    pub kind: ViolationKind,
    /// Tag the violation concerns
    pub tag_name: String,
    pub severity: Severity,
    /// Value currently on the resource, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
    /// Allowed values, included for invalid-value violations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    /// Monthly cost of the owning resource, attached when cost data was
    /// computed in the same scan
    #[serde(default)]
    pub monthly_cost_impact: f64,
}

/// A resource with no tags at all, or missing required tags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UntaggedResource {
    pub arn: String,
    pub resource_type: String,
    pub region: String,
    pub tag_count: usize,
    pub missing_tags: Vec<String>,
    #[serde(default)]
    pub monthly_cost: f64,
}

/// Result of validating one set of resources against the policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceResult {
    /// Fraction of resources with zero error-severity violations
    pub compliance_score: f64,
    pub total_resources: usize,
    pub compliant_resources: usize,
    pub non_compliant_resources: usize,
    /// Violations ordered by severity, then resource id
    pub violations: Vec<Violation>,
    /// Total spend minus attributable spend, filled by the cost service
    #[serde(default)]
    pub cost_attribution_gap: f64,
    pub scanned_at: DateTime<Utc>,
}

impl ComplianceResult {
    /// Empty result: nothing scanned means nothing non-compliant
    pub fn empty() -> Self {
        Self {
            compliance_score: 1.0,
            total_resources: 0,
            compliant_resources: 0,
            non_compliant_resources: 0,
            violations: Vec::new(),
            cost_attribution_gap: 0.0,
            scanned_at: Utc::now(),
        }
    }
}

/// Pure validation over a supplied set of resources given a policy snapshot
pub struct ComplianceService;

impl ComplianceService {
    /// Validate resources against the policy.
    ///
    /// The severity filter trims the emitted violation list; compliance
    /// counts and the score always use error-severity violations only.
    pub fn evaluate(
        resources: &[Resource],
        policy: &TagPolicy,
        severity: SeverityFilter,
    ) -> ComplianceResult {
        let mut violations = Vec::new();
        let mut compliant = 0usize;

        for resource in resources {
            let resource_violations = Self::check_resource(resource, policy);
            let has_error = resource_violations
                .iter()
                .any(|v| v.severity == Severity::Error);
            if !has_error {
                compliant += 1;
            }
            violations.extend(
                resource_violations
                    .into_iter()
                    .filter(|v| severity.includes(v.severity)),
            );
        }

        violations.sort_by(|a, b| {
            a.severity
                .rank()
                .cmp(&b.severity.rank())
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });

        let total = resources.len();
        ComplianceResult {
            compliance_score: Self::score(compliant, total),
            total_resources: total,
            compliant_resources: compliant,
            non_compliant_resources: total - compliant,
            violations,
            cost_attribution_gap: 0.0,
            scanned_at: Utc::now(),
        }
    }

    /// `compliant / total`, defined as 1.0 on an empty set
    pub fn score(compliant: usize, total: usize) -> f64 {
        if total == 0 {
            1.0
        } else {
            compliant as f64 / total as f64
        }
    }

    /// All violations for one resource, unfiltered
    fn check_resource(resource: &Resource, policy: &TagPolicy) -> Vec<Violation> {
        let mut violations = Vec::new();

        for required in policy.required_tags_for(&resource.resource_type) {
            match resource.tags.get(&required.name) {
                None => violations.push(Violation {
                    resource_id: resource.resource_id().to_string(),
                    resource_type: resource.resource_type.clone(),
                    region: resource.region.clone(),
                    kind: ViolationKind::MissingRequiredTag,
                    tag_name: required.name.clone(),
                    severity: Severity::Error,
                    current_value: None,
                    allowed_values: required.allowed_values.clone(),
                    monthly_cost_impact: 0.0,
                }),
                Some(value) => {
                    // Allowed values and pattern both apply when both are set
                    if let Some(allowed) = &required.allowed_values {
                        if !allowed.contains(value) {
                            violations.push(Violation {
                                resource_id: resource.resource_id().to_string(),
                                resource_type: resource.resource_type.clone(),
                                region: resource.region.clone(),
                                kind: ViolationKind::InvalidValue,
                                tag_name: required.name.clone(),
                                severity: Severity::Error,
                                current_value: Some(value.clone()),
                                allowed_values: Some(allowed.clone()),
                                monthly_cost_impact: 0.0,
                            });
                        }
                    }
                    if let Some(pattern) = required.regex() {
                        if !pattern.is_match(value) {
                            violations.push(Violation {
                                resource_id: resource.resource_id().to_string(),
                                resource_type: resource.resource_type.clone(),
                                region: resource.region.clone(),
                                kind: ViolationKind::InvalidFormat,
                                tag_name: required.name.clone(),
                                severity: Severity::Error,
                                current_value: Some(value.clone()),
                                allowed_values: None,
                                monthly_cost_impact: 0.0,
                            });
                        }
                    }
                }
            }
        }

        if policy.naming_rules.enabled {
            violations.extend(Self::check_naming(resource, policy));
        }

        violations
    }

    /// Naming-rule breaches, reported as warnings
    fn check_naming(resource: &Resource, policy: &TagPolicy) -> Vec<Violation> {
        let rules = &policy.naming_rules;
        let mut violations = Vec::new();

        for (key, value) in &resource.tags {
            let mut problem = None;
            if key.len() as i64 > rules.max_key_length {
                problem = Some(format!("key exceeds {} characters", rules.max_key_length));
            } else if value.len() as i64 > rules.max_value_length {
                problem = Some(format!(
                    "value exceeds {} characters",
                    rules.max_value_length
                ));
            } else {
                match rules.key_case {
                    TagCase::Any => {}
                    TagCase::Pascal => {
                        if !key.chars().next().map(|c| c.is_uppercase()).unwrap_or(true) {
                            problem = Some("key is not PascalCase".to_string());
                        }
                    }
                    TagCase::Lower => {
                        if key.chars().any(|c| c.is_uppercase()) {
                            problem = Some("key is not lowercase".to_string());
                        }
                    }
                }
            }

            if let Some(reason) = problem {
                violations.push(Violation {
                    resource_id: resource.resource_id().to_string(),
                    resource_type: resource.resource_type.clone(),
                    region: resource.region.clone(),
                    kind: ViolationKind::InvalidFormat,
                    tag_name: key.clone(),
                    severity: Severity::Warning,
                    current_value: Some(reason),
                    allowed_values: None,
                    monthly_cost_impact: 0.0,
                });
            }
        }

        violations
    }

    /// Untagged view over the same resources: zero tags, or missing required
    /// tags
    pub fn find_untagged(resources: &[Resource], policy: &TagPolicy) -> Vec<UntaggedResource> {
        let mut untagged = Vec::new();
        for resource in resources {
            let missing: Vec<String> = policy
                .required_tags_for(&resource.resource_type)
                .into_iter()
                .filter(|t| !resource.tags.contains_key(&t.name))
                .map(|t| t.name.clone())
                .collect();
            if resource.tags.is_empty() || !missing.is_empty() {
                untagged.push(UntaggedResource {
                    arn: resource.arn.clone(),
                    resource_type: resource.resource_type.clone(),
                    region: resource.region.clone(),
                    tag_count: resource.tags.len(),
                    missing_tags: missing,
                    monthly_cost: 0.0,
                });
            }
        }
        untagged.sort_by(|a, b| a.arn.cmp(&b.arn));
        untagged
    }

    /// Attach per-resource monthly costs to violations, keyed by resource id
    pub fn attach_cost_impacts(result: &mut ComplianceResult, costs: &HashMap<String, f64>) {
        for violation in &mut result.violations {
            if let Some(cost) = costs.get(&violation.resource_id) {
                violation.monthly_cost_impact = *cost;
            }
        }
    }
}
