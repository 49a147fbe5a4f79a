use crate::compliance::ComplianceResult;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One point-in-time compliance measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceSnapshot {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub compliance_score: f64,
    pub total_resources: i64,
    pub compliant_resources: i64,
    pub violation_count: i64,
    pub cost_attribution_gap: f64,
}

/// Snapshot before the store assigns its id
#[derive(Debug, Clone)]
pub struct NewComplianceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub compliance_score: f64,
    pub total_resources: i64,
    pub compliant_resources: i64,
    pub violation_count: i64,
    pub cost_attribution_gap: f64,
}

impl NewComplianceSnapshot {
    /// Snapshot of an aggregate compliance result
    pub fn from_result(result: &ComplianceResult) -> Self {
        Self {
            timestamp: result.scanned_at,
            compliance_score: result.compliance_score,
            total_resources: result.total_resources as i64,
            compliant_resources: result.compliant_resources as i64,
            violation_count: result.violations.len() as i64,
            cost_attribution_gap: result.cost_attribution_gap,
        }
    }
}

/// Compliance-history persistence
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, snapshot: &NewComplianceSnapshot) -> Result<i64>;
    /// Snapshots at or after `since`, oldest first
    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<ComplianceSnapshot>>;
}

/// SQLite-backed history store
pub struct SqliteHistoryStore {
    pool: sqlx::SqlitePool,
}

impl SqliteHistoryStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::store(format!("Failed to open history store: {}", e)))?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &sqlx::SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS compliance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                compliance_score REAL NOT NULL,
                total_resources INTEGER NOT NULL,
                compliant_resources INTEGER NOT NULL,
                violation_count INTEGER NOT NULL,
                cost_attribution_gap REAL NOT NULL
            );
        "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Error::store(format!("Failed to create history table: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_timestamp ON compliance_history(timestamp);",
        )
        .execute(pool)
        .await
        .map_err(|e| Error::store(format!("Failed to create history index: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, snapshot: &NewComplianceSnapshot) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO compliance_history
                (timestamp, compliance_score, total_resources, compliant_resources, violation_count, cost_attribution_gap)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        )
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(snapshot.compliance_score)
        .bind(snapshot.total_resources)
        .bind(snapshot.compliant_resources)
        .bind(snapshot.violation_count)
        .bind(snapshot.cost_attribution_gap)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store(format!("Failed to append snapshot: {}", e)))?;
        Ok(result.last_insert_rowid())
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<ComplianceSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp, compliance_score, total_resources, compliant_resources,
                   violation_count, cost_attribution_gap
            FROM compliance_history
            WHERE timestamp >= ?1
            ORDER BY id ASC
        "#,
        )
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store(format!("Failed to query history: {}", e)))?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp: String = row.try_get("timestamp")?;
            snapshots.push(ComplianceSnapshot {
                id: row.try_get("id")?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| Error::store(format!("Bad timestamp in snapshot: {}", e)))?
                    .to_utc(),
                compliance_score: row.try_get("compliance_score")?,
                total_resources: row.try_get("total_resources")?,
                compliant_resources: row.try_get("compliant_resources")?,
                violation_count: row.try_get("violation_count")?,
                cost_attribution_gap: row.try_get("cost_attribution_gap")?,
            });
        }
        Ok(snapshots)
    }
}

/// In-memory history store for tests and ephemeral runs
#[derive(Default)]
pub struct InMemoryHistoryStore {
    snapshots: Mutex<Vec<ComplianceSnapshot>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, snapshot: &NewComplianceSnapshot) -> Result<i64> {
        let mut snapshots = self.snapshots.lock().await;
        let id = snapshots.len() as i64 + 1;
        snapshots.push(ComplianceSnapshot {
            id,
            timestamp: snapshot.timestamp,
            compliance_score: snapshot.compliance_score,
            total_resources: snapshot.total_resources,
            compliant_resources: snapshot.compliant_resources,
            violation_count: snapshot.violation_count,
            cost_attribution_gap: snapshot.cost_attribution_gap,
        });
        Ok(id)
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<ComplianceSnapshot>> {
        let snapshots = self.snapshots.lock().await;
        Ok(snapshots
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect())
    }
}

/// How history buckets are keyed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryGroupBy {
    #[default]
    Day,
    Week,
    Month,
}

impl HistoryGroupBy {
    fn bucket_key(&self, timestamp: &DateTime<Utc>) -> String {
        match self {
            HistoryGroupBy::Day => timestamp.format("%Y-%m-%d").to_string(),
            HistoryGroupBy::Week => {
                let week = timestamp.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            HistoryGroupBy::Month => timestamp.format("%Y-%m").to_string(),
        }
    }
}

/// Score movement across the queried window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

/// One aggregated history bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryBucket {
    pub period: String,
    pub snapshot_count: usize,
    pub average_score: f64,
    pub average_violations: f64,
    pub latest_score: f64,
}

/// Aggregated history over a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceHistory {
    pub days_back: u32,
    pub group_by: HistoryGroupBy,
    pub buckets: Vec<HistoryBucket>,
    pub trend: Trend,
}

/// Appends snapshots and answers windowed queries over them
pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Append one snapshot
    pub async fn append(&self, snapshot: NewComplianceSnapshot) -> Result<i64> {
        self.store.append(&snapshot).await
    }

    /// Aggregate the window into buckets and compute the trend by comparing
    /// the latest snapshot against the earliest within the window
    pub async fn get_history(
        &self,
        days_back: u32,
        group_by: HistoryGroupBy,
    ) -> Result<ComplianceHistory> {
        let since = Utc::now() - Duration::days(days_back as i64);
        let snapshots = self.store.since(since).await?;

        let mut grouped: BTreeMap<String, Vec<&ComplianceSnapshot>> = BTreeMap::new();
        for snapshot in &snapshots {
            grouped
                .entry(group_by.bucket_key(&snapshot.timestamp))
                .or_default()
                .push(snapshot);
        }

        let buckets = grouped
            .into_iter()
            .map(|(period, members)| {
                let count = members.len();
                let average_score =
                    members.iter().map(|s| s.compliance_score).sum::<f64>() / count as f64;
                let average_violations =
                    members.iter().map(|s| s.violation_count as f64).sum::<f64>() / count as f64;
                HistoryBucket {
                    period,
                    snapshot_count: count,
                    average_score,
                    average_violations,
                    latest_score: members
                        .last()
                        .map(|s| s.compliance_score)
                        .unwrap_or(0.0),
                }
            })
            .collect();

        let trend = match (snapshots.first(), snapshots.last()) {
            (Some(earliest), Some(latest)) if snapshots.len() > 1 => {
                let delta = latest.compliance_score - earliest.compliance_score;
                if delta > 0.01 {
                    Trend::Improving
                } else if delta < -0.01 {
                    Trend::Declining
                } else {
                    Trend::Stable
                }
            }
            _ => Trend::Stable,
        };

        Ok(ComplianceHistory {
            days_back,
            group_by,
            buckets,
            trend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(days_ago: i64, score: f64) -> NewComplianceSnapshot {
        NewComplianceSnapshot {
            timestamp: Utc::now() - Duration::days(days_ago),
            compliance_score: score,
            total_resources: 10,
            compliant_resources: (score * 10.0) as i64,
            violation_count: 10 - (score * 10.0) as i64,
            cost_attribution_gap: 100.0,
        }
    }

    #[tokio::test]
    async fn trend_improving_declining_stable() {
        let service = HistoryService::new(Arc::new(InMemoryHistoryStore::new()));
        service.append(snapshot(5, 0.5)).await.unwrap();
        service.append(snapshot(1, 0.8)).await.unwrap();
        let history = service.get_history(7, HistoryGroupBy::Day).await.unwrap();
        assert_eq!(history.trend, Trend::Improving);

        let service = HistoryService::new(Arc::new(InMemoryHistoryStore::new()));
        service.append(snapshot(5, 0.9)).await.unwrap();
        service.append(snapshot(1, 0.4)).await.unwrap();
        let history = service.get_history(7, HistoryGroupBy::Day).await.unwrap();
        assert_eq!(history.trend, Trend::Declining);

        let service = HistoryService::new(Arc::new(InMemoryHistoryStore::new()));
        service.append(snapshot(5, 0.7)).await.unwrap();
        service.append(snapshot(1, 0.705)).await.unwrap();
        let history = service.get_history(7, HistoryGroupBy::Day).await.unwrap();
        assert_eq!(history.trend, Trend::Stable);
    }

    #[tokio::test]
    async fn window_excludes_old_snapshots() {
        let service = HistoryService::new(Arc::new(InMemoryHistoryStore::new()));
        service.append(snapshot(30, 0.2)).await.unwrap();
        service.append(snapshot(2, 0.9)).await.unwrap();
        let history = service.get_history(7, HistoryGroupBy::Day).await.unwrap();
        let total: usize = history.buckets.iter().map(|b| b.snapshot_count).sum();
        assert_eq!(total, 1);
        // Single in-window snapshot cannot establish a direction
        assert_eq!(history.trend, Trend::Stable);
    }

    #[tokio::test]
    async fn buckets_group_by_month() {
        let service = HistoryService::new(Arc::new(InMemoryHistoryStore::new()));
        service.append(snapshot(3, 0.5)).await.unwrap();
        service.append(snapshot(2, 0.6)).await.unwrap();
        service.append(snapshot(1, 0.7)).await.unwrap();
        let history = service.get_history(10, HistoryGroupBy::Month).await.unwrap();
        // Either one month or two across a boundary; counts must add up
        let total: usize = history.buckets.iter().map(|b| b.snapshot_count).sum();
        assert_eq!(total, 3);
        for bucket in &history.buckets {
            assert!(bucket.average_score > 0.0);
        }
    }

    #[tokio::test]
    async fn sqlite_history_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteHistoryStore::open(dir.path().join("history.db"))
            .await
            .unwrap();
        let first = store.append(&snapshot(1, 0.5)).await.unwrap();
        let second = store.append(&snapshot(0, 0.6)).await.unwrap();
        assert!(second > first);

        let all = store.since(Utc::now() - Duration::days(7)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!((all[0].compliance_score - 0.5).abs() < f64::EPSILON);
    }
}
