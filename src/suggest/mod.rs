use crate::cloud::{parse_arn, ProviderFactory, Resource};
use crate::error::Result;
use crate::policy::PolicyStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A proposed value for a missing tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagSuggestion {
    pub tag_key: String,
    pub suggested_value: String,
    /// Share of evidence supporting the pick, in [0,1]
    pub confidence: f64,
    /// Human-readable sentence citing the evidence
    pub reasoning: String,
}

/// Proposes values for a resource's missing policy tags from its
/// neighbourhood and name heuristics
pub struct SuggestionService {
    factory: Arc<dyn ProviderFactory>,
    policy_store: Arc<PolicyStore>,
    default_region: String,
}

impl SuggestionService {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        policy_store: Arc<PolicyStore>,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            policy_store,
            default_region: default_region.into(),
        }
    }

    /// Suggest values for every policy tag the resource is missing.
    ///
    /// Heuristics in order of specificity: majority value among neighbouring
    /// resources of the same type, a resource-name token matching an allowed
    /// value, then the policy's declared default.
    pub async fn suggest_tags(&self, resource_arn: &str) -> Result<Vec<TagSuggestion>> {
        let parts = parse_arn(resource_arn)?;
        let resource_type = parts.type_string();
        let region = if parts.region.is_empty() {
            self.default_region.clone()
        } else {
            parts.region.clone()
        };

        let provider = self.factory.provider_for(&region).await?;
        let tags = provider
            .get_tags_for_arns(std::slice::from_ref(&resource_arn.to_string()))
            .await?
            .remove(resource_arn)
            .unwrap_or_default();

        // Neighbourhood: same-type resources in the same region and account
        let neighbours: Vec<Resource> = provider
            .list_resources(&resource_type)
            .await?
            .into_iter()
            .filter(|r| r.arn != resource_arn)
            .collect();
        debug!(
            arn = %resource_arn,
            neighbours = neighbours.len(),
            "Building tag suggestions"
        );

        let policy = self.policy_store.current().await;
        let mut suggestions = Vec::new();

        for required in policy.required_tags_for(&resource_type) {
            if tags.contains_key(&required.name) {
                continue;
            }

            if let Some(suggestion) =
                Self::majority_of_neighbourhood(&required.name, &neighbours, &resource_type)
            {
                suggestions.push(suggestion);
                continue;
            }

            if let Some(suggestion) = Self::name_token_match(
                &required.name,
                required.allowed_values.as_deref(),
                tags.get("Name").map(|s| s.as_str()),
                &parts.resource_id,
            ) {
                suggestions.push(suggestion);
                continue;
            }

            if let Some(default) = &required.default_value {
                suggestions.push(TagSuggestion {
                    tag_key: required.name.clone(),
                    suggested_value: default.clone(),
                    confidence: 0.3,
                    reasoning: format!(
                        "The tagging policy declares '{}' as the default value for {}",
                        default, required.name
                    ),
                });
            }
        }

        Ok(suggestions)
    }

    /// Majority vote over the neighbourhood's values for one tag. Confidence
    /// is the winner's share of the neighbours that carry the tag.
    fn majority_of_neighbourhood(
        tag_name: &str,
        neighbours: &[Resource],
        resource_type: &str,
    ) -> Option<TagSuggestion> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for neighbour in neighbours {
            if let Some(value) = neighbour.tags.get(tag_name) {
                *counts.entry(value.as_str()).or_insert(0) += 1;
            }
        }
        let carrying: usize = counts.values().sum();
        if carrying == 0 {
            return None;
        }
        // Deterministic winner: highest count, ties broken by value
        let (winner, count) = counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))?;

        Some(TagSuggestion {
            tag_key: tag_name.to_string(),
            suggested_value: winner.to_string(),
            confidence: count as f64 / carrying as f64,
            reasoning: format!(
                "{} of {} neighbouring {} resources carry {}={}",
                count, carrying, resource_type, tag_name, winner
            ),
        })
    }

    /// Match a token of the resource name (or id) against the tag's allowed
    /// values
    fn name_token_match(
        tag_name: &str,
        allowed_values: Option<&[String]>,
        name_tag: Option<&str>,
        resource_id: &str,
    ) -> Option<TagSuggestion> {
        let allowed = allowed_values?;
        let source = name_tag.unwrap_or(resource_id);
        for token in source.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            if let Some(value) = allowed.iter().find(|v| v.eq_ignore_ascii_case(token)) {
                return Some(TagSuggestion {
                    tag_key: tag_name.to_string(),
                    suggested_value: value.clone(),
                    confidence: 0.6,
                    reasoning: format!(
                        "Resource name token '{}' matches the allowed value '{}' for {}",
                        token, value, tag_name
                    ),
                });
            }
        }
        None
    }

}
