use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How a resource type participates in cost attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceCategory {
    /// Generates attributable spend (instances, databases, buckets)
    CostGenerating,
    /// Discoverable but free (security groups, subnets)
    Free,
    /// Generates spend that cannot be assigned to a single resource
    Unattributable,
    /// Account-level resource that lives outside any region
    Global,
}

/// Catalog entry for one supported resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTypeInfo {
    /// Canonical type string, `service:kind`
    pub resource_type: String,
    /// Category of the type
    pub category: ResourceCategory,
    /// Name the cost API reports this type's spend under
    pub cost_service_name: String,
}

/// Raw catalog file shape
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    resource_types: Vec<ResourceTypeInfo>,
    /// Types excluded from the "all applicable" set
    #[serde(default)]
    excluded_types: Vec<String>,
}

/// Resource-type catalog, loaded once from config and immutable afterwards.
///
/// Classifies every supported type and maps it to the service name the cost
/// API reports its spend under.
#[derive(Debug, Clone)]
pub struct ResourceTypeCatalog {
    entries: HashMap<String, ResourceTypeInfo>,
    excluded: HashSet<String>,
}

impl ResourceTypeCatalog {
    /// Load the catalog from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read resource-type catalog: {}", e)))?;
        Self::from_str(&contents)
    }

    /// Parse the catalog from a JSON string
    pub fn from_str(contents: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(contents)
            .map_err(|e| Error::config(format!("Failed to parse resource-type catalog: {}", e)))?;

        let mut entries = HashMap::with_capacity(file.resource_types.len());
        for info in file.resource_types {
            if info.resource_type.split(':').count() != 2 {
                return Err(Error::config(format!(
                    "Invalid resource type '{}': expected service:kind",
                    info.resource_type
                )));
            }
            entries.insert(info.resource_type.clone(), info);
        }

        Ok(Self {
            entries,
            excluded: file.excluded_types.into_iter().collect(),
        })
    }

    /// Built-in catalog covering the supported services
    pub fn builtin() -> Self {
        let mut entries = HashMap::new();
        for (resource_type, category, cost_service_name) in [
            ("ec2:instance", ResourceCategory::CostGenerating, "Amazon Elastic Compute Cloud - Compute"),
            ("ec2:volume", ResourceCategory::CostGenerating, "Amazon Elastic Compute Cloud - Compute"),
            ("ec2:security-group", ResourceCategory::Free, ""),
            ("ec2:subnet", ResourceCategory::Free, ""),
            ("ec2:natgateway", ResourceCategory::Unattributable, "Amazon Elastic Compute Cloud - Compute"),
            ("rds:db", ResourceCategory::CostGenerating, "Amazon Relational Database Service"),
            ("lambda:function", ResourceCategory::CostGenerating, "AWS Lambda"),
            ("ecs:cluster", ResourceCategory::CostGenerating, "Amazon Elastic Container Service"),
            ("dynamodb:table", ResourceCategory::CostGenerating, "Amazon DynamoDB"),
            ("elasticloadbalancing:loadbalancer", ResourceCategory::CostGenerating, "Amazon Elastic Load Balancing"),
            ("s3:bucket", ResourceCategory::Global, "Amazon Simple Storage Service"),
            ("iam:role", ResourceCategory::Global, ""),
            ("iam:user", ResourceCategory::Global, ""),
            ("iam:policy", ResourceCategory::Global, ""),
            ("cloudfront:distribution", ResourceCategory::Global, "Amazon CloudFront"),
            ("route53:hostedzone", ResourceCategory::Global, "Amazon Route 53"),
        ] {
            entries.insert(
                resource_type.to_string(),
                ResourceTypeInfo {
                    resource_type: resource_type.to_string(),
                    category,
                    cost_service_name: cost_service_name.to_string(),
                },
            );
        }
        Self {
            entries,
            excluded: HashSet::new(),
        }
    }

    /// Category of a type, if the type is known
    pub fn category(&self, resource_type: &str) -> Option<ResourceCategory> {
        self.entries.get(resource_type).map(|e| e.category)
    }

    /// Cost-service name for a type, if it has one
    pub fn cost_service_name(&self, resource_type: &str) -> Option<&str> {
        self.entries
            .get(resource_type)
            .map(|e| e.cost_service_name.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Whether the type is known to the catalog
    pub fn is_known(&self, resource_type: &str) -> bool {
        self.entries.contains_key(resource_type)
    }

    /// Whether the type is an account-level global resource
    pub fn is_global(&self, resource_type: &str) -> bool {
        self.category(resource_type) == Some(ResourceCategory::Global)
    }

    /// All applicable resource types: the union of cost-generating and free
    /// types, minus any explicitly excluded ones
    pub fn all_applicable_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .values()
            .filter(|e| {
                e.category == ResourceCategory::CostGenerating
                    || e.category == ResourceCategory::Free
            })
            .filter(|e| !self.excluded.contains(&e.resource_type))
            .map(|e| e.resource_type.clone())
            .collect();
        types.sort();
        types
    }

    /// Types whose spend cannot be attributed per-resource
    pub fn unattributable_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.category == ResourceCategory::Unattributable)
            .map(|e| e.resource_type.clone())
            .collect();
        types.sort();
        types
    }

    /// Catalog entries in stable order
    pub fn entries(&self) -> Vec<&ResourceTypeInfo> {
        let mut list: Vec<&ResourceTypeInfo> = self.entries.values().collect();
        list.sort_by(|a, b| a.resource_type.cmp(&b.resource_type));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_classifies_types() {
        let catalog = ResourceTypeCatalog::builtin();
        assert_eq!(
            catalog.category("ec2:instance"),
            Some(ResourceCategory::CostGenerating)
        );
        assert_eq!(catalog.category("iam:role"), Some(ResourceCategory::Global));
        assert_eq!(
            catalog.category("ec2:natgateway"),
            Some(ResourceCategory::Unattributable)
        );
        assert!(catalog.category("unknown:thing").is_none());
    }

    #[test]
    fn all_applicable_is_cost_generating_union_free() {
        let catalog = ResourceTypeCatalog::builtin();
        let all = catalog.all_applicable_types();
        assert!(all.contains(&"ec2:instance".to_string()));
        assert!(all.contains(&"ec2:subnet".to_string()));
        assert!(!all.contains(&"ec2:natgateway".to_string()));
        assert!(!all.contains(&"s3:bucket".to_string()));
        assert!(!all.contains(&"iam:role".to_string()));
    }

    #[test]
    fn parses_catalog_json_and_honours_exclusions() {
        let catalog = ResourceTypeCatalog::from_str(
            r#"{
                "resource_types": [
                    {"resource_type": "ec2:instance", "category": "cost-generating", "cost_service_name": "Amazon Elastic Compute Cloud - Compute"},
                    {"resource_type": "ec2:subnet", "category": "free", "cost_service_name": ""}
                ],
                "excluded_types": ["ec2:subnet"]
            }"#,
        )
        .unwrap();
        assert_eq!(catalog.all_applicable_types(), vec!["ec2:instance"]);
        assert_eq!(
            catalog.cost_service_name("ec2:instance"),
            Some("Amazon Elastic Compute Cloud - Compute")
        );
        assert_eq!(catalog.cost_service_name("ec2:subnet"), None);
    }

    #[test]
    fn rejects_malformed_type_strings() {
        let result = ResourceTypeCatalog::from_str(
            r#"{"resource_types": [{"resource_type": "ec2instance", "category": "free", "cost_service_name": ""}]}"#,
        );
        assert!(result.is_err());
    }
}
