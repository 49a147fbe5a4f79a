use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Key prefix for cached compliance results
pub const COMPLIANCE_KEY_PREFIX: &str = "compliance:";

/// Redis-shaped key/value backend contract.
///
/// Single-operation atomic; no multi-key transactions are needed anywhere.
/// A networked backend satisfies this trait without touching callers.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a value with a TTL
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Delete every key under a prefix; returns the number removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
    /// Atomically increment a counter, creating it at 1
    async fn incr(&self, key: &str) -> Result<i64>;
    /// Set the TTL on an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }
}

/// In-process cache backend. The default when no cache URL is configured,
/// and the backend every test runs against.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| !e.is_expired());
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let current = match entries.get(key) {
            Some(entry) if !entry.is_expired() => entry
                .value
                .parse::<i64>()
                .map_err(|_| Error::cache(format!("Counter {} holds a non-integer", key)))?,
            _ => 0,
        };
        let next = current + 1;
        // An expired counter restarts without inheriting its old expiry
        let expires_at = entries
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

/// Parameters that together identify one compliance query. The cache key is
/// derived from the canonical JSON of this set, so any reordering of inputs
/// maps to the same key.
#[derive(Debug, Clone)]
pub struct CacheKeyParams {
    pub cost_region: String,
    pub resource_types: Vec<String>,
    pub filters: BTreeMap<String, String>,
    pub severity: String,
    pub regions: Vec<String>,
    pub policy_version: String,
}

impl CacheKeyParams {
    /// Canonical JSON: key-sorted object, sorted lists, no whitespace
    fn canonical_json(&self) -> String {
        let mut resource_types = self.resource_types.clone();
        resource_types.sort();
        let mut regions = self.regions.clone();
        regions.sort();

        let mut object = BTreeMap::new();
        object.insert("cost_region", serde_json::json!(self.cost_region));
        object.insert("filters", serde_json::json!(self.filters));
        object.insert("policy_version", serde_json::json!(self.policy_version));
        object.insert("regions", serde_json::json!(regions));
        object.insert("resource_types", serde_json::json!(resource_types));
        object.insert("severity", serde_json::json!(self.severity));
        serde_json::to_string(&object).unwrap_or_default()
    }

    /// Content-addressed cache key
    pub fn key(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        format!("{}{}", COMPLIANCE_KEY_PREFIX, hex::encode(digest))
    }
}

/// Content-addressed result cache over a shared backend.
///
/// Backend failures are logged and degrade to misses; a broken cache never
/// fails a scan.
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
        }
    }

    /// Shared backend handle, used by the guardrails for their counters
    pub fn backend(&self) -> Arc<dyn CacheBackend> {
        self.backend.clone()
    }

    /// Look up a cached value. Any backend or deserialisation failure is a
    /// miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key, error = %e, "Discarding undeserialisable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed; treating as miss");
                None
            }
        }
    }

    /// Write-through with the default TTL
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        self.put_with_ttl(key, value, self.default_ttl).await
    }

    /// Write-through with an explicit TTL. Failures are logged and swallowed.
    pub async fn put_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialise cache value");
                return;
            }
        };
        if let Err(e) = self.backend.set_ex(key, &raw, ttl).await {
            warn!(key, error = %e, "Cache write failed");
        } else {
            debug!(key, ttl_secs = ttl.as_secs(), "Cached value");
        }
    }

    /// Drop every entry under a prefix
    pub async fn invalidate(&self, prefix: &str) -> u64 {
        match self.backend.delete_prefix(prefix).await {
            Ok(count) => count,
            Err(e) => {
                warn!(prefix, error = %e, "Cache invalidation failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CacheKeyParams {
        CacheKeyParams {
            cost_region: "us-east-1".to_string(),
            resource_types: vec!["ec2:instance".to_string(), "s3:bucket".to_string()],
            filters: BTreeMap::from([("Environment".to_string(), "prod".to_string())]),
            severity: "all".to_string(),
            regions: vec!["eu-west-1".to_string(), "us-east-1".to_string()],
            policy_version: "2024-06".to_string(),
        }
    }

    #[test]
    fn key_is_invariant_under_reordering() {
        let a = params();
        let mut b = params();
        b.resource_types.reverse();
        b.regions.reverse();
        assert_eq!(a.key(), b.key());
        assert!(a.key().starts_with(COMPLIANCE_KEY_PREFIX));
    }

    #[test]
    fn key_changes_with_any_parameter() {
        let base = params().key();

        let mut other = params();
        other.severity = "errors_only".to_string();
        assert_ne!(base, other.key());

        let mut other = params();
        other.policy_version = "2024-07".to_string();
        assert_ne!(base, other.key());

        let mut other = params();
        other.filters.insert("Owner".to_string(), "x".to_string());
        assert_ne!(base, other.key());
    }

    #[tokio::test]
    async fn memory_backend_round_trip_and_ttl() {
        let backend = MemoryCacheBackend::new();
        backend
            .set_ex("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_backend_incr_and_prefix_delete() {
        let backend = MemoryCacheBackend::new();
        assert_eq!(backend.incr("budget:s1").await.unwrap(), 1);
        assert_eq!(backend.incr("budget:s1").await.unwrap(), 2);
        assert_eq!(backend.incr("budget:s2").await.unwrap(), 1);

        let removed = backend.delete_prefix("budget:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(backend.incr("budget:s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undeserialisable_entry_is_a_miss() {
        let backend = Arc::new(MemoryCacheBackend::new());
        backend
            .set_ex("compliance:abc", "not json {", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = ResultCache::new(backend, Duration::from_secs(60));
        let value: Option<Vec<String>> = cache.get("compliance:abc").await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn result_cache_round_trip() {
        let cache = ResultCache::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(60),
        );
        cache.put("compliance:xyz", &vec![1u32, 2, 3]).await;
        let value: Option<Vec<u32>> = cache.get("compliance:xyz").await;
        assert_eq!(value, Some(vec![1, 2, 3]));

        assert_eq!(cache.invalidate(COMPLIANCE_KEY_PREFIX).await, 1);
        let value: Option<Vec<u32>> = cache.get("compliance:xyz").await;
        assert!(value.is_none());
    }
}
