use crate::compliance::Violation;
use crate::scanner::MultiRegionComplianceResult;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Output format of a rendered report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Csv,
    Markdown,
}

/// Money renders at two decimals; internal arithmetic keeps full precision
fn money(value: f64) -> String {
    format!("{:.2}", value)
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render an already-computed scan result. Cost columns are omitted when
/// every per-resource cost is exactly zero, the typical outcome of a
/// tag-API-only scan.
pub fn render(
    result: &MultiRegionComplianceResult,
    format: ReportFormat,
    include_recommendations: bool,
) -> String {
    match format {
        ReportFormat::Json => render_json(result, include_recommendations),
        ReportFormat::Csv => render_csv(&result.result.violations),
        ReportFormat::Markdown => render_markdown(result, include_recommendations),
    }
}

/// CSV view over a violation list, usable on its own for exports
pub fn render_csv(violations: &[Violation]) -> String {
    let with_cost = violations.iter().any(|v| v.monthly_cost_impact != 0.0);
    let mut out = String::new();
    if with_cost {
        out.push_str(
            "resource_id,resource_type,region,violation,tag,severity,current_value,monthly_cost_impact\n",
        );
    } else {
        out.push_str("resource_id,resource_type,region,violation,tag,severity,current_value\n");
    }
    for violation in violations {
        let kind = serde_json::to_value(violation.kind)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        let severity = serde_json::to_value(violation.severity)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        let mut fields = vec![
            csv_field(&violation.resource_id),
            csv_field(&violation.resource_type),
            csv_field(&violation.region),
            kind,
            csv_field(&violation.tag_name),
            severity,
            csv_field(violation.current_value.as_deref().unwrap_or("")),
        ];
        if with_cost {
            fields.push(money(violation.monthly_cost_impact));
        }
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn render_json(result: &MultiRegionComplianceResult, include_recommendations: bool) -> String {
    let mut report = json!({
        "summary": {
            "compliance_score": result.result.compliance_score,
            "total_resources": result.result.total_resources,
            "compliant_resources": result.result.compliant_resources,
            "non_compliant_resources": result.result.non_compliant_resources,
            "violation_count": result.result.violations.len(),
            "cost_attribution_gap": result.result.cost_attribution_gap,
            "scanned_at": result.result.scanned_at,
        },
        "violations": result.result.violations,
        "region_breakdown": result.region_breakdown,
        "region_metadata": result.region_metadata,
    });
    if include_recommendations {
        report["recommendations"] = json!(recommendations(result));
    }
    serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
}

fn render_markdown(result: &MultiRegionComplianceResult, include_recommendations: bool) -> String {
    let summary = &result.result;
    let with_cost = summary
        .violations
        .iter()
        .any(|v| v.monthly_cost_impact != 0.0);

    let mut out = String::new();
    out.push_str("# Tag Compliance Report\n\n");
    out.push_str("## Summary\n\n");
    out.push_str(&format!(
        "- Compliance score: **{:.1}%**\n",
        summary.compliance_score * 100.0
    ));
    out.push_str(&format!("- Resources scanned: {}\n", summary.total_resources));
    out.push_str(&format!("- Compliant: {}\n", summary.compliant_resources));
    out.push_str(&format!(
        "- Non-compliant: {}\n",
        summary.non_compliant_resources
    ));
    out.push_str(&format!("- Violations: {}\n", summary.violations.len()));
    if summary.cost_attribution_gap != 0.0 {
        out.push_str(&format!(
            "- Cost attribution gap: ${}\n",
            money(summary.cost_attribution_gap)
        ));
    }
    out.push_str(&format!("- Scanned at: {}\n", summary.scanned_at.to_rfc3339()));

    let metadata = &result.region_metadata;
    if !metadata.failed_regions.is_empty() || metadata.discovery_failed {
        out.push_str("\n## Scan Coverage\n\n");
        if metadata.discovery_failed {
            out.push_str("- Region discovery failed; only the default region was scanned\n");
        }
        for failed in &metadata.failed_regions {
            out.push_str(&format!("- Region `{}` failed: {}\n", failed.region, failed.error));
        }
    }

    if !result.region_breakdown.is_empty() {
        out.push_str("\n## Regions\n\n");
        out.push_str("| Region | Resources | Compliant | Violations | Score |\n");
        out.push_str("|---|---|---|---|---|\n");
        let mut regions: Vec<_> = result.region_breakdown.iter().collect();
        regions.sort_by(|a, b| a.0.cmp(b.0));
        for (region, breakdown) in regions {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {:.1}% |\n",
                region,
                breakdown.total_resources,
                breakdown.compliant_resources,
                breakdown.violation_count,
                breakdown.compliance_score * 100.0
            ));
        }
    }

    if !summary.violations.is_empty() {
        out.push_str("\n## Violations\n\n");
        if with_cost {
            out.push_str("| Resource | Type | Region | Violation | Tag | Severity | Monthly cost |\n");
            out.push_str("|---|---|---|---|---|---|---|\n");
        } else {
            out.push_str("| Resource | Type | Region | Violation | Tag | Severity |\n");
            out.push_str("|---|---|---|---|---|---|\n");
        }
        for violation in &summary.violations {
            let kind = serde_json::to_value(violation.kind)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            let severity = serde_json::to_value(violation.severity)
                .ok()
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            if with_cost {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} | ${} |\n",
                    violation.resource_id,
                    violation.resource_type,
                    violation.region,
                    kind,
                    violation.tag_name,
                    severity,
                    money(violation.monthly_cost_impact)
                ));
            } else {
                out.push_str(&format!(
                    "| {} | {} | {} | {} | {} | {} |\n",
                    violation.resource_id,
                    violation.resource_type,
                    violation.region,
                    kind,
                    violation.tag_name,
                    severity
                ));
            }
        }
    }

    if include_recommendations {
        let recommendations = recommendations(result);
        if !recommendations.is_empty() {
            out.push_str("\n## Recommendations\n\n");
            for recommendation in recommendations {
                out.push_str(&format!("- {}\n", recommendation));
            }
        }
    }

    out
}

/// Recommendations derived from the violation groups: the most-violated tags
/// and the costliest non-compliant resources
fn recommendations(result: &MultiRegionComplianceResult) -> Vec<String> {
    let mut by_tag: HashMap<&str, usize> = HashMap::new();
    for violation in &result.result.violations {
        *by_tag.entry(violation.tag_name.as_str()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(&str, usize)> = by_tag.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut recommendations = Vec::new();
    for (tag, count) in ranked.into_iter().take(3) {
        recommendations.push(format!(
            "Tag '{}' accounts for {} violation(s); consider a tagging campaign or a default value",
            tag, count
        ));
    }

    let mut costly: Vec<&Violation> = result
        .result
        .violations
        .iter()
        .filter(|v| v.monthly_cost_impact > 0.0)
        .collect();
    costly.sort_by(|a, b| {
        b.monthly_cost_impact
            .partial_cmp(&a.monthly_cost_impact)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for violation in costly.into_iter().take(3) {
        recommendations.push(format!(
            "Resource {} spends ${} per month while non-compliant; tag it first",
            violation.resource_id,
            money(violation.monthly_cost_impact)
        ));
    }

    recommendations
}
