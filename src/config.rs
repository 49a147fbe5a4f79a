use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Cloud account settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    /// Region the cost-explorer client is bound to. The cloud serves cost
    /// data from this one region only, regardless of resource region.
    #[serde(default = "default_cost_region")]
    pub cost_region: String,
    /// Region scanned when discovery fails
    #[serde(default = "default_region")]
    pub default_region: String,
    /// Operator allow-list of regions. Empty means all enabled regions.
    #[serde(default)]
    pub allowed_regions: Vec<String>,
    /// Minimum interval between calls to the same cloud service, in milliseconds
    #[serde(default = "default_min_call_interval_ms")]
    pub min_call_interval_ms: u64,
}

fn default_cost_region() -> String {
    "us-east-1".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_min_call_interval_ms() -> u64 {
    100
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            cost_region: default_cost_region(),
            default_region: default_region(),
            allowed_regions: Vec::new(),
            min_call_interval_ms: default_min_call_interval_ms(),
        }
    }
}

/// Shared cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Cache backend connection URL. None selects the in-process backend.
    pub cache_url: Option<String>,
    /// Cache backend password
    pub cache_password: Option<String>,
    /// Default TTL for cached values in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    /// TTL for cached region discovery results in seconds
    #[serde(default = "default_region_cache_ttl")]
    pub region_cache_ttl_seconds: u64,
    /// TTL for cached compliance results in seconds (60-86400)
    #[serde(default = "default_compliance_cache_ttl")]
    pub compliance_cache_ttl_seconds: u64,
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_region_cache_ttl() -> u64 {
    3600
}

fn default_compliance_cache_ttl() -> u64 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_url: None,
            cache_password: None,
            cache_ttl_seconds: default_cache_ttl(),
            region_cache_ttl_seconds: default_region_cache_ttl(),
            compliance_cache_ttl_seconds: default_compliance_cache_ttl(),
        }
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Path to the append-only audit store
    #[serde(default = "default_audit_store_path")]
    pub audit_store_path: String,
    /// Path to the compliance-history store
    #[serde(default = "default_history_store_path")]
    pub history_store_path: String,
}

fn default_audit_store_path() -> String {
    "audit.db".to_string()
}

fn default_history_store_path() -> String {
    "history.db".to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            audit_store_path: default_audit_store_path(),
            history_store_path: default_history_store_path(),
        }
    }
}

/// Multi-region scanner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    /// Bounded pool size for region fan-out (1-20)
    #[serde(default = "default_max_concurrent_regions")]
    pub max_concurrent_regions: usize,
    /// Per-region scan deadline in seconds (10-300)
    #[serde(default = "default_region_scan_timeout")]
    pub region_scan_timeout_seconds: u64,
}

fn default_max_concurrent_regions() -> usize {
    5
}

fn default_region_scan_timeout() -> u64 {
    60
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_regions: default_max_concurrent_regions(),
            region_scan_timeout_seconds: default_region_scan_timeout(),
        }
    }
}

/// Session guardrail settings. Every guardrail ships disabled so that
/// upgrading never changes the behaviour of an existing deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailSettings {
    /// Enable the per-session budget tracker
    #[serde(default)]
    pub budget_tracking_enabled: bool,
    /// Maximum tool calls per session
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_session: u64,
    /// TTL of the per-session budget counter in seconds
    #[serde(default = "default_session_budget_ttl")]
    pub session_budget_ttl_seconds: u64,
    /// Enable the identical-call loop detector
    #[serde(default)]
    pub loop_detection_enabled: bool,
    /// Identical calls tolerated inside the sliding window
    #[serde(default = "default_max_identical_calls")]
    pub max_identical_calls: u64,
    /// Loop detection sliding window in seconds
    #[serde(default = "default_loop_window")]
    pub loop_detection_window_seconds: u64,
    /// Enable security event logging
    #[serde(default)]
    pub security_monitoring_enabled: bool,
    /// Enable request sanitisation and injection detection
    #[serde(default)]
    pub request_sanitization_enabled: bool,
}

fn default_max_tool_calls() -> u64 {
    100
}

fn default_session_budget_ttl() -> u64 {
    3600
}

fn default_max_identical_calls() -> u64 {
    3
}

fn default_loop_window() -> u64 {
    60
}

impl Default for GuardrailSettings {
    fn default() -> Self {
        Self {
            budget_tracking_enabled: false,
            max_tool_calls_per_session: default_max_tool_calls(),
            session_budget_ttl_seconds: default_session_budget_ttl(),
            loop_detection_enabled: false,
            max_identical_calls: default_max_identical_calls(),
            loop_detection_window_seconds: default_loop_window(),
            security_monitoring_enabled: false,
            request_sanitization_enabled: false,
        }
    }
}

/// Transport-level size bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportLimits {
    /// Maximum request body size in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size_bytes: usize,
    /// Maximum header size in bytes
    #[serde(default = "default_max_header_size")]
    pub max_header_size_bytes: usize,
    /// Maximum header count
    #[serde(default = "default_max_header_count")]
    pub max_header_count: usize,
    /// Maximum query string length
    #[serde(default = "default_max_query_string")]
    pub max_query_string_length: usize,
    /// Maximum path length
    #[serde(default = "default_max_path_length")]
    pub max_path_length: usize,
}

fn default_max_request_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_header_size() -> usize {
    8 * 1024
}

fn default_max_header_count() -> usize {
    50
}

fn default_max_query_string() -> usize {
    4096
}

fn default_max_path_length() -> usize {
    2048
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_request_size_bytes: default_max_request_size(),
            max_header_size_bytes: default_max_header_size(),
            max_header_count: default_max_header_count(),
            max_query_string_length: default_max_query_string(),
            max_path_length: default_max_path_length(),
        }
    }
}

/// Main configuration structure, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the JSON tag policy
    #[serde(default = "default_policy_path")]
    pub policy_path: String,
    /// Path to the resource-type catalog JSON
    #[serde(default = "default_resource_types_path")]
    pub resource_types_config_path: String,
    /// Tags that make a resource attributable for the cost-attribution gap
    #[serde(default = "default_cost_attribution_tags")]
    pub cost_attribution_tags: Vec<String>,
    #[serde(default)]
    pub cloud: CloudSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub stores: StoreSettings,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub guardrails: GuardrailSettings,
    #[serde(default)]
    pub limits: TransportLimits,
}

fn default_policy_path() -> String {
    "tag-policy.json".to_string()
}

fn default_resource_types_path() -> String {
    "resource-types.json".to_string()
}

fn default_cost_attribution_tags() -> Vec<String> {
    vec![
        "CostCenter".to_string(),
        "Owner".to_string(),
        "Environment".to_string(),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            resource_types_config_path: default_resource_types_path(),
            cost_attribution_tags: default_cost_attribution_tags(),
            cloud: CloudSettings::default(),
            cache: CacheSettings::default(),
            stores: StoreSettings::default(),
            scanner: ScannerSettings::default(),
            guardrails: GuardrailSettings::default(),
            limits: TransportLimits::default(),
        }
    }
}

impl Settings {
    /// Create settings with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a JSON file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;
        let mut settings = Self::from_str(&contents)?;
        settings.apply_env();
        settings.validate().map(|_| settings)
    }

    /// Parse settings from a JSON string
    pub fn from_str(contents: &str) -> Result<Self> {
        let settings = serde_json::from_str::<Self>(contents)
            .map_err(|e| Error::config(format!("Failed to parse config: {}", e)))?;
        settings.validate().map(|_| settings)
    }

    /// Load settings from environment variables only
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env();
        settings.validate().map(|_| settings)
    }

    /// Apply environment variable overrides (FINOPS_MCP_* keys)
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("FINOPS_MCP_POLICY_PATH") {
            self.policy_path = v;
        }
        if let Ok(v) = env::var("FINOPS_MCP_RESOURCE_TYPES_CONFIG_PATH") {
            self.resource_types_config_path = v;
        }
        if let Ok(v) = env::var("FINOPS_MCP_COST_REGION") {
            self.cloud.cost_region = v;
        }
        if let Ok(v) = env::var("FINOPS_MCP_DEFAULT_REGION") {
            self.cloud.default_region = v;
        }
        if let Ok(v) = env::var("FINOPS_MCP_ALLOWED_REGIONS") {
            self.cloud.allowed_regions = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("FINOPS_MCP_CACHE_URL") {
            self.cache.cache_url = Some(v);
        }
        if let Ok(v) = env::var("FINOPS_MCP_CACHE_PASSWORD") {
            self.cache.cache_password = Some(v);
        }
        if let Ok(v) = env::var("FINOPS_MCP_CACHE_TTL_SECONDS") {
            if let Ok(n) = v.parse() {
                self.cache.cache_ttl_seconds = n;
            }
        }
        if let Ok(v) = env::var("FINOPS_MCP_AUDIT_STORE_PATH") {
            self.stores.audit_store_path = v;
        }
        if let Ok(v) = env::var("FINOPS_MCP_HISTORY_STORE_PATH") {
            self.stores.history_store_path = v;
        }
        if let Ok(v) = env::var("FINOPS_MCP_MAX_CONCURRENT_REGIONS") {
            if let Ok(n) = v.parse() {
                self.scanner.max_concurrent_regions = n;
            }
        }
        if let Ok(v) = env::var("FINOPS_MCP_REGION_SCAN_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse() {
                self.scanner.region_scan_timeout_seconds = n;
            }
        }
        if let Ok(v) = env::var("FINOPS_MCP_BUDGET_TRACKING_ENABLED") {
            self.guardrails.budget_tracking_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("FINOPS_MCP_LOOP_DETECTION_ENABLED") {
            self.guardrails.loop_detection_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("FINOPS_MCP_SECURITY_MONITORING_ENABLED") {
            self.guardrails.security_monitoring_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("FINOPS_MCP_REQUEST_SANITIZATION_ENABLED") {
            self.guardrails.request_sanitization_enabled = v == "true" || v == "1";
        }
    }

    /// Validate settings, collecting every violation before failing
    pub fn validate(&self) -> Result<()> {
        let mut validation_errors = Vec::with_capacity(8);

        if self.cloud.cost_region.is_empty() {
            validation_errors.push("cost_region must not be empty".to_string());
        }
        if self.policy_path.is_empty() {
            validation_errors.push("policy_path must not be empty".to_string());
        }
        if !(1..=20).contains(&self.scanner.max_concurrent_regions) {
            validation_errors.push(format!(
                "max_concurrent_regions must be in 1..=20, got {}",
                self.scanner.max_concurrent_regions
            ));
        }
        if !(10..=300).contains(&self.scanner.region_scan_timeout_seconds) {
            validation_errors.push(format!(
                "region_scan_timeout_seconds must be in 10..=300, got {}",
                self.scanner.region_scan_timeout_seconds
            ));
        }
        if !(60..=86_400).contains(&self.cache.compliance_cache_ttl_seconds) {
            validation_errors.push(format!(
                "compliance_cache_ttl_seconds must be in 60..=86400, got {}",
                self.cache.compliance_cache_ttl_seconds
            ));
        }
        if self.guardrails.budget_tracking_enabled && self.guardrails.max_tool_calls_per_session == 0
        {
            validation_errors.push("max_tool_calls_per_session must be positive".to_string());
        }
        if self.guardrails.loop_detection_enabled && self.guardrails.max_identical_calls == 0 {
            validation_errors.push("max_identical_calls must be positive".to_string());
        }

        if validation_errors.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(validation_errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scanner.max_concurrent_regions, 5);
        assert_eq!(settings.scanner.region_scan_timeout_seconds, 60);
        assert!(!settings.guardrails.budget_tracking_enabled);
        assert!(!settings.guardrails.loop_detection_enabled);
    }

    #[test]
    fn rejects_out_of_range_scanner_settings() {
        let mut settings = Settings::default();
        settings.scanner.max_concurrent_regions = 0;
        assert!(settings.validate().is_err());

        settings.scanner.max_concurrent_regions = 21;
        assert!(settings.validate().is_err());

        settings.scanner.max_concurrent_regions = 20;
        settings.scanner.region_scan_timeout_seconds = 5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parses_partial_json() {
        let settings = Settings::from_str(
            r#"{"cloud": {"cost_region": "us-east-1", "allowed_regions": ["eu-west-1"]}}"#,
        )
        .unwrap();
        assert_eq!(settings.cloud.allowed_regions, vec!["eu-west-1"]);
        assert_eq!(settings.cache.compliance_cache_ttl_seconds, 3600);
    }

    #[test]
    fn cost_attribution_tags_default() {
        let settings = Settings::default();
        assert_eq!(
            settings.cost_attribution_tags,
            vec!["CostCenter", "Owner", "Environment"]
        );
    }
}
