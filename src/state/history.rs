//! Sync Outcome History
//!
//! Persistent per-day success/failure counters for sync requests issued
//! by this node, keyed by (secondary, wallet, sync type, day).

use std::path::Path;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::SyncType;

/// Length of the rolling window, in days
pub const ROLLING_WINDOW_DAYS: i64 = 30;

/// Outcome of one monitored sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcomeKind {
    Success,
    Failure,
}

/// Success/failure counts with derived success rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SyncMetrics {
    pub success_count: u64,
    pub failure_count: u64,
}

impl SyncMetrics {
    pub fn total(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// 1.0 when there are no samples
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.success_count as f64 / total as f64,
        }
    }
}

/// Node-wide totals for today and the rolling window
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HistorySummary {
    pub daily: SyncMetrics,
    pub rolling: SyncMetrics,
}

/// Sync outcome history backed by SQLite
pub struct SyncHistory {
    conn: Mutex<Connection>,
}

impl SyncHistory {
    /// Create or open the history database under `state_dir`
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let conn = Connection::open(state_dir.join("sync_history.db"))?;
        Self::init(conn)
    }

    /// In-memory history, lost on drop
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_outcomes (
                secondary TEXT NOT NULL,
                wallet TEXT NOT NULL,
                sync_type TEXT NOT NULL,
                day TEXT NOT NULL,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (secondary, wallet, sync_type, day)
            );

            CREATE INDEX IF NOT EXISTS idx_sync_outcomes_day
                ON sync_outcomes(day);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Drop the outcomes table so later reads fail
    #[cfg(test)]
    pub(crate) async fn corrupt(&self) {
        let conn = self.conn.lock().await;
        conn.execute_batch("DROP TABLE sync_outcomes").unwrap();
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn day_key(day: NaiveDate) -> String {
        day.format("%Y-%m-%d").to_string()
    }

    /// Record an outcome for today
    pub async fn record(
        &self,
        secondary: &str,
        wallet: &str,
        sync_type: SyncType,
        outcome: SyncOutcomeKind,
    ) -> Result<()> {
        self.record_on(Self::today(), secondary, wallet, sync_type, outcome).await
    }

    pub async fn record_success(&self, secondary: &str, wallet: &str, sync_type: SyncType) -> Result<()> {
        self.record(secondary, wallet, sync_type, SyncOutcomeKind::Success).await
    }

    pub async fn record_failure(&self, secondary: &str, wallet: &str, sync_type: SyncType) -> Result<()> {
        self.record(secondary, wallet, sync_type, SyncOutcomeKind::Failure).await
    }

    /// Record an outcome on a given day
    pub async fn record_on(
        &self,
        day: NaiveDate,
        secondary: &str,
        wallet: &str,
        sync_type: SyncType,
        outcome: SyncOutcomeKind,
    ) -> Result<()> {
        let (success, failure) = match outcome {
            SyncOutcomeKind::Success => (1i64, 0i64),
            SyncOutcomeKind::Failure => (0, 1),
        };

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO sync_outcomes (secondary, wallet, sync_type, day, success_count, failure_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(secondary, wallet, sync_type, day) DO UPDATE SET
                success_count = success_count + ?5,
                failure_count = failure_count + ?6
            "#,
            params![secondary, wallet, sync_type.as_str(), Self::day_key(day), success, failure],
        )?;
        Ok(())
    }

    /// Today's failure count for one (secondary, wallet, sync type)
    pub async fn failure_count_today(&self, secondary: &str, wallet: &str, sync_type: SyncType) -> Result<u64> {
        self.failure_count_on(Self::today(), secondary, wallet, sync_type).await
    }

    pub async fn failure_count_on(
        &self,
        day: NaiveDate,
        secondary: &str,
        wallet: &str,
        sync_type: SyncType,
    ) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: Option<i64> = conn
            .query_row(
                r#"
                SELECT failure_count FROM sync_outcomes
                WHERE secondary = ?1 AND wallet = ?2 AND sync_type = ?3 AND day = ?4
                "#,
                params![secondary, wallet, sync_type.as_str(), Self::day_key(day)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    /// Today's metrics for a (secondary, wallet), across sync types
    pub async fn user_metrics_today(&self, secondary: &str, wallet: &str) -> Result<SyncMetrics> {
        self.user_metrics_on(Self::today(), secondary, wallet).await
    }

    pub async fn user_metrics_on(&self, day: NaiveDate, secondary: &str, wallet: &str) -> Result<SyncMetrics> {
        let conn = self.conn.lock().await;
        let metrics = conn.query_row(
            r#"
            SELECT COALESCE(SUM(success_count), 0), COALESCE(SUM(failure_count), 0)
            FROM sync_outcomes
            WHERE secondary = ?1 AND wallet = ?2 AND day = ?3
            "#,
            params![secondary, wallet, Self::day_key(day)],
            |row| {
                Ok(SyncMetrics {
                    success_count: row.get::<_, i64>(0)? as u64,
                    failure_count: row.get::<_, i64>(1)? as u64,
                })
            },
        )?;
        Ok(metrics)
    }

    /// Node-wide totals for today and the trailing window ending today
    pub async fn summary(&self) -> Result<HistorySummary> {
        self.summary_on(Self::today()).await
    }

    pub async fn summary_on(&self, today: NaiveDate) -> Result<HistorySummary> {
        let window_start = today - ChronoDuration::days(ROLLING_WINDOW_DAYS - 1);
        let conn = self.conn.lock().await;
        let totals = |from: &str, to: &str| -> Result<SyncMetrics> {
            Ok(conn.query_row(
                r#"
                SELECT COALESCE(SUM(success_count), 0), COALESCE(SUM(failure_count), 0)
                FROM sync_outcomes WHERE day >= ?1 AND day <= ?2
                "#,
                params![from, to],
                |row| {
                    Ok(SyncMetrics {
                        success_count: row.get::<_, i64>(0)? as u64,
                        failure_count: row.get::<_, i64>(1)? as u64,
                    })
                },
            )?)
        };

        let today_key = Self::day_key(today);
        Ok(HistorySummary {
            daily: totals(&today_key, &today_key)?,
            rolling: totals(&Self::day_key(window_start), &today_key)?,
        })
    }

    /// Metrics per secondary for today, for introspection
    pub async fn secondary_metrics_today(&self, secondary: &str) -> Result<Vec<(String, SyncType, SyncMetrics)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT wallet, sync_type, success_count, failure_count FROM sync_outcomes
            WHERE secondary = ?1 AND day = ?2
            ORDER BY wallet, sync_type
            "#,
        )?;

        let rows = stmt.query_map(params![secondary, Self::day_key(Self::today())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                SyncMetrics {
                    success_count: row.get::<_, i64>(2)? as u64,
                    failure_count: row.get::<_, i64>(3)? as u64,
                },
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (wallet, sync_type, metrics) = row?;
            result.push((wallet, sync_type.parse()?, metrics));
        }
        Ok(result)
    }

    /// Delete rows older than the rolling window
    pub async fn prune(&self, today: NaiveDate) -> Result<usize> {
        let cutoff = today - ChronoDuration::days(ROLLING_WINDOW_DAYS);
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM sync_outcomes WHERE day < ?1",
            params![Self::day_key(cutoff)],
        )?;
        Ok(deleted)
    }
}
