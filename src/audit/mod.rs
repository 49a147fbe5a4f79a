use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Outcome recorded for a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
        }
    }
}

/// One appended audit row. Rows are never mutated; ids are strictly
/// increasing per store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub tool_name: String,
    /// Canonical JSON of the call parameters; replaced by the violation kind
    /// for security-violation failures
    pub parameters_json: String,
    pub status: AuditStatus,
    pub execution_time_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// An audit row before the store assigns its id
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub tool_name: String,
    pub parameters_json: String,
    pub status: AuditStatus,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
}

/// Bounded query over the audit log
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub tool_name: Option<String>,
    pub status: Option<AuditStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Append-only audit persistence
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one row; returns the assigned id
    async fn append(&self, entry: &NewAuditEntry) -> Result<i64>;
    /// Query rows newest-first, bounded by `query.limit`
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>>;
}

/// SQLite-backed audit store
pub struct SqliteAuditStore {
    pool: sqlx::SqlitePool,
}

impl SqliteAuditStore {
    /// Open (or create) the store at a path and bootstrap the schema
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::store(format!("Failed to open audit store: {}", e)))?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                parameters_json TEXT NOT NULL,
                status TEXT NOT NULL,
                execution_time_ms INTEGER NOT NULL,
                error_message TEXT
            );
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Error::store(format!("Failed to create audit table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);")
            .execute(pool)
            .await
            .map_err(|e| Error::store(format!("Failed to create audit index: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, entry: &NewAuditEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log
                (timestamp, correlation_id, tool_name, parameters_json, status, execution_time_ms, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        )
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.correlation_id)
        .bind(&entry.tool_name)
        .bind(&entry.parameters_json)
        .bind(entry.status.as_str())
        .bind(entry.execution_time_ms)
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store(format!("Failed to append audit entry: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT id, timestamp, correlation_id, tool_name, parameters_json, status, \
             execution_time_ms, error_message FROM audit_log WHERE 1=1",
        );
        if query.tool_name.is_some() {
            sql.push_str(" AND tool_name = ?");
        }
        if query.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if query.since.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(tool_name) = &query.tool_name {
            q = q.bind(tool_name);
        }
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        if let Some(since) = query.since {
            q = q.bind(since.to_rfc3339());
        }
        q = q.bind(query.limit.max(1) as i64);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::store(format!("Failed to query audit log: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let timestamp: String = row.try_get("timestamp")?;
    let status: String = row.try_get("status")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| Error::store(format!("Bad timestamp in audit row: {}", e)))?
            .to_utc(),
        correlation_id: row.try_get("correlation_id")?,
        tool_name: row.try_get("tool_name")?,
        parameters_json: row.try_get("parameters_json")?,
        status: if status == "success" {
            AuditStatus::Success
        } else {
            AuditStatus::Failure
        },
        execution_time_ms: row.try_get("execution_time_ms")?,
        error_message: row.try_get("error_message")?,
    })
}

/// In-memory audit store for tests and ephemeral runs
#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: &NewAuditEntry) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let id = entries.len() as i64 + 1;
        entries.push(AuditEntry {
            id,
            timestamp: entry.timestamp,
            correlation_id: entry.correlation_id.clone(),
            tool_name: entry.tool_name.clone(),
            parameters_json: entry.parameters_json.clone(),
            status: entry.status,
            execution_time_ms: entry.execution_time_ms,
            error_message: entry.error_message.clone(),
        });
        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.lock().await;
        let mut matching: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| {
                query
                    .tool_name
                    .as_ref()
                    .map(|t| &e.tool_name == t)
                    .unwrap_or(true)
                    && query.status.map(|s| e.status == s).unwrap_or(true)
                    && query.since.map(|s| e.timestamp >= s).unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        matching.truncate(query.limit.max(1));
        Ok(matching)
    }
}

/// Appends exactly one entry per tool invocation and serves bounded queries.
///
/// Append failures are logged and swallowed; a broken audit store must not
/// fail the tool call it describes.
pub struct AuditService {
    store: Arc<dyn AuditStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append one entry
    pub async fn record(&self, entry: NewAuditEntry) {
        if let Err(e) = self.store.append(&entry).await {
            warn!(
                tool = %entry.tool_name,
                error = %e,
                "Failed to append audit entry"
            );
        }
    }

    /// Query entries newest-first
    pub async fn get_logs(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        self.store.query(query).await
    }
}
