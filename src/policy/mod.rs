use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// A tag the policy requires on matching resource types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredTag {
    /// Tag key
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Closed set of allowed values, if any
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
    /// Format pattern the value must match, if any. When both the allowed
    /// value set and the pattern are present, both apply.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Default value a suggestion may fall back to
    #[serde(default)]
    pub default_value: Option<String>,
    /// Resource types this tag applies to; empty means every type
    #[serde(default)]
    pub applies_to: Vec<String>,
    /// Compiled form of `pattern`
    #[serde(skip)]
    compiled_pattern: Option<Regex>,
}

impl RequiredTag {
    /// Whether this tag applies to the given resource type
    pub fn applies_to_type(&self, resource_type: &str) -> bool {
        self.applies_to.is_empty() || self.applies_to.iter().any(|t| t == resource_type)
    }

    /// Compiled format pattern, if the tag declares one
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled_pattern.as_ref()
    }
}

/// A tag the policy recognises but does not require
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionalTag {
    /// Tag key
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Closed set of allowed values, if any
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
}

/// Tag key/value casing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagCase {
    /// No casing requirement
    #[default]
    Any,
    /// Keys must be PascalCase
    Pascal,
    /// Keys must be lowercase
    Lower,
}

/// Naming rules applied to tag keys and values as warnings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingRules {
    /// Whether naming checks run at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Required key casing
    #[serde(default)]
    pub key_case: TagCase,
    /// Maximum tag key length
    #[serde(default = "default_max_key_length")]
    pub max_key_length: i64,
    /// Maximum tag value length
    #[serde(default = "default_max_value_length")]
    pub max_value_length: i64,
}

fn default_true() -> bool {
    true
}

fn default_max_key_length() -> i64 {
    128
}

fn default_max_value_length() -> i64 {
    256
}

impl Default for NamingRules {
    fn default() -> Self {
        Self {
            enabled: true,
            key_case: TagCase::Any,
            max_key_length: default_max_key_length(),
            max_value_length: default_max_value_length(),
        }
    }
}

/// Declarative tagging policy. Immutable while live; `PolicyStore::reload`
/// swaps the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagPolicy {
    /// Policy version, included in cache keys
    pub version: String,
    /// Required tags in declaration order
    pub required_tags: Vec<RequiredTag>,
    /// Optional tags
    #[serde(default)]
    pub optional_tags: Vec<OptionalTag>,
    /// Naming rules
    #[serde(default)]
    pub naming_rules: NamingRules,
}

impl TagPolicy {
    /// Parse and validate a policy from a JSON string
    pub fn from_str(contents: &str) -> Result<Self> {
        let mut policy: TagPolicy = serde_json::from_str(contents)
            .map_err(|e| Error::policy_validation(format!("Malformed policy JSON: {}", e)))?;
        policy.validate_and_compile()?;
        Ok(policy)
    }

    /// Parse and validate a policy from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::policy_validation(format!(
                "Failed to read policy file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_str(&contents)
    }

    fn validate_and_compile(&mut self) -> Result<()> {
        if self.version.is_empty() {
            return Err(Error::policy_validation("Policy version must not be empty"));
        }
        if self.naming_rules.max_key_length < 0 || self.naming_rules.max_value_length < 0 {
            return Err(Error::policy_validation(
                "Naming rule bounds must be non-negative",
            ));
        }
        for tag in &mut self.required_tags {
            if tag.name.is_empty() {
                return Err(Error::policy_validation(
                    "Every required tag must have a name",
                ));
            }
            if let Some(values) = &tag.allowed_values {
                if values.is_empty() {
                    return Err(Error::policy_validation(format!(
                        "Tag '{}' declares an empty allowed-value set",
                        tag.name
                    )));
                }
            }
            for applies in &tag.applies_to {
                if applies.split(':').count() != 2 {
                    return Err(Error::policy_validation(format!(
                        "Tag '{}' applies_to entry '{}' is not a service:kind type string",
                        tag.name, applies
                    )));
                }
            }
            if let Some(pattern) = &tag.pattern {
                let compiled = Regex::new(pattern).map_err(|e| {
                    Error::policy_validation(format!(
                        "Tag '{}' has an invalid pattern: {}",
                        tag.name, e
                    ))
                })?;
                tag.compiled_pattern = Some(compiled);
            }
        }
        Ok(())
    }

    /// Required tags whose `applies_to` is empty or contains the type
    pub fn required_tags_for(&self, resource_type: &str) -> Vec<&RequiredTag> {
        self.required_tags
            .iter()
            .filter(|t| t.applies_to_type(resource_type))
            .collect()
    }

    /// Allowed values for a required tag, if declared
    pub fn allowed_values(&self, tag_name: &str) -> Option<&Vec<String>> {
        self.required_tags
            .iter()
            .find(|t| t.name == tag_name)
            .and_then(|t| t.allowed_values.as_ref())
    }

    /// Compiled format pattern for a required tag, if declared
    pub fn regex(&self, tag_name: &str) -> Option<&Regex> {
        self.required_tags
            .iter()
            .find(|t| t.name == tag_name)
            .and_then(|t| t.regex())
    }

    /// Default value for a required tag, if declared
    pub fn default_value(&self, tag_name: &str) -> Option<&str> {
        self.required_tags
            .iter()
            .find(|t| t.name == tag_name)
            .and_then(|t| t.default_value.as_deref())
    }
}

/// Loads, validates and caches the tag policy.
///
/// The live policy is an `Arc` snapshot; `reload` swaps it atomically so
/// in-flight scans keep the snapshot they started with.
pub struct PolicyStore {
    path: PathBuf,
    current: RwLock<Arc<TagPolicy>>,
}

impl PolicyStore {
    /// Load the policy from a file. Fails with `policy-validation-error` on
    /// malformed input; the server does not start in that case.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let policy = TagPolicy::from_file(path.as_ref())?;
        info!(
            version = %policy.version,
            required = policy.required_tags.len(),
            "Loaded tag policy"
        );
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            current: RwLock::new(Arc::new(policy)),
        })
    }

    /// Build a store around an already-validated policy (tests, embedded use)
    pub fn from_policy(policy: TagPolicy) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// Current policy snapshot
    pub async fn current(&self) -> Arc<TagPolicy> {
        self.current.read().await.clone()
    }

    /// Re-read the policy file and swap the snapshot atomically. On failure
    /// the previous snapshot stays live.
    pub async fn reload(&self) -> Result<Arc<TagPolicy>> {
        let policy = Arc::new(TagPolicy::from_file(&self.path)?);
        let mut guard = self.current.write().await;
        *guard = policy.clone();
        info!(version = %policy.version, "Reloaded tag policy");
        Ok(policy)
    }
}
