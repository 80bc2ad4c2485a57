//! Watermark-driven trace promotion
//!
//! Every invocation reads the job's watermark, waits until the window behind
//! it has matured, takes the cluster lock and copies the interesting traces
//! of the staging table into the final table before moving the watermark.
//! Any failed step ends the invocation; the next tick is the retry. Without
//! a readable watermark row the job does nothing until one is written.
//!
//! The copy only inserts spans missing from the final table, so replaying a
//! window (after a failed watermark update, or when two instances overlap
//! past the lock TTL) never duplicates rows.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::{JobConfig, TableNames};
use crate::executor::QueryExecutor;
use crate::lock::LockCoordinator;
use crate::scheduler::PeriodicJob;
use crate::store::{de, Param};
use crate::time::{format_store_datetime, parse_store_datetime, to_epoch_nanos, TimeProvider};
use crate::{Error, JobStage, Result};

/// Span kind of the serving side of a call
pub const SPAN_KIND_SERVER: i64 = 2;

/// Which staged traces are kept for good
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Server spans at least this slow keep their whole trace
    pub slow_threshold: Duration,
    /// Spans with a status code at or above this keep their whole trace
    pub min_error_status: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_secs(2),
            min_error_status: 400,
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            slow_threshold: Duration::from_millis(config.slow_threshold_ms),
            ..Self::default()
        }
    }

    /// Insert-select that promotes every interesting staged span at or after
    /// a lower bound, skipping spans already in the final table. Binds with
    /// [`RetentionPolicy::promotion_params`].
    pub fn promotion_sql(&self, tables: &TableNames) -> String {
        format!(
            "INSERT INTO {final_spans} SELECT * FROM {staging} \
             WHERE timestamp >= ? \
             AND traceID IN (SELECT DISTINCT traceID FROM {staging} \
             WHERE (kind = ? AND durationNano >= ?) OR statusCode >= ?) \
             AND spanID NOT IN (SELECT DISTINCT spanID FROM {final_spans})",
            final_spans = tables.final_spans,
            staging = tables.staging_spans,
        )
    }

    pub fn promotion_params(&self, from: DateTime<Utc>) -> Vec<Param> {
        vec![
            Param::DateTime64(to_epoch_nanos(from)),
            Param::Int(SPAN_KIND_SERVER),
            Param::UInt(self.slow_threshold.as_nanos() as u64),
            Param::Int(self.min_error_status),
        ]
    }
}

/// How an invocation ended when nothing failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The window behind the watermark has not matured yet
    NotDue { watermark: DateTime<Utc> },
    /// No readable watermark is recorded for the job; nothing is promoted
    /// until one is
    NoWatermark,
    /// Another instance holds the lock
    LockHeld,
    Promoted {
        from: DateTime<Utc>,
        watermark: DateTime<Utc>,
    },
}

#[derive(Deserialize)]
struct WatermarkRow {
    #[serde(deserialize_with = "de::string_or_default")]
    last_success_date: String,
}

pub struct WatermarkPromotionJob {
    executor: Arc<QueryExecutor>,
    lock: Arc<dyn LockCoordinator>,
    clock: Arc<dyn TimeProvider>,
    config: JobConfig,
    tables: TableNames,
    policy: RetentionPolicy,
}

impl WatermarkPromotionJob {
    pub fn new(
        executor: Arc<QueryExecutor>,
        lock: Arc<dyn LockCoordinator>,
        clock: Arc<dyn TimeProvider>,
        config: JobConfig,
        tables: TableNames,
    ) -> Self {
        let policy = RetentionPolicy::from_config(&config);
        Self {
            executor,
            lock,
            clock,
            config,
            tables,
            policy,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run one invocation through read, gate, lock, promote and advance
    pub async fn run(&self) -> Result<JobOutcome> {
        let watermark = match self
            .read_watermark()
            .await
            .map_err(|e| Error::job(JobStage::ReadWatermark, e))?
        {
            Some(watermark) => watermark,
            None => return Ok(JobOutcome::NoWatermark),
        };
        let Some(from) = watermark.checked_sub_signed(self.config.lookback()) else {
            warn!(job = %self.config.job_key, watermark = %watermark, "watermark out of range, not promoting");
            return Ok(JobOutcome::NoWatermark);
        };

        let now = self.clock.now();
        if now - self.config.grace() < watermark {
            debug!(job = %self.config.job_key, watermark = %watermark, "window not matured yet");
            return Ok(JobOutcome::NotDue { watermark });
        }

        let acquired = self
            .lock
            .try_acquire(
                &self.config.job_key,
                &format_store_datetime(now),
                Duration::from_secs(self.config.lock_ttl_secs),
            )
            .await?;
        if !acquired {
            debug!(job = %self.config.job_key, "lock held by another instance");
            return Ok(JobOutcome::LockHeld);
        }

        let sql = self.policy.promotion_sql(&self.tables);
        let params = self.policy.promotion_params(from);
        self.executor
            .execute_write(&sql, |statement| statement.exec(params.clone()))
            .await
            .map_err(|e| Error::job(JobStage::Promote, e))?;

        let advanced = self.clock.now();
        self.advance_watermark(advanced)
            .await
            .map_err(|e| Error::job(JobStage::AdvanceWatermark, e))?;

        info!(job = %self.config.job_key, from = %from, watermark = %advanced, "promoted staged traces");
        Ok(JobOutcome::Promoted {
            from,
            watermark: advanced,
        })
    }

    /// The stored watermark, or `None` when no row exists or it can't be read
    async fn read_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT last_success_date FROM {} FINAL WHERE last_success_key = ?",
            self.tables.watermark
        );
        let row: Option<WatermarkRow> = self
            .executor
            .select_one(&sql, &[Param::from(self.config.job_key.as_str())])
            .await?;

        let Some(row) = row else {
            warn!(job = %self.config.job_key, table = %self.tables.watermark, "no watermark recorded, not promoting");
            return Ok(None);
        };
        let watermark = parse_store_datetime(&row.last_success_date);
        if watermark.is_none() {
            warn!(job = %self.config.job_key, watermark = %row.last_success_date, "unreadable watermark, not promoting");
        }
        Ok(watermark)
    }

    async fn advance_watermark(&self, watermark: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (last_success_key, last_success_date, event_time) VALUES (?, ?, ?)",
            self.tables.watermark
        );
        let key = self.config.job_key.clone();
        let secs = watermark.timestamp();
        self.executor
            .execute_write(&sql, |statement| {
                statement.exec(vec![
                    Param::from(key.as_str()),
                    Param::DateTime(secs),
                    Param::DateTime(secs),
                ])
            })
            .await
    }
}

#[async_trait]
impl PeriodicJob for WatermarkPromotionJob {
    fn name(&self) -> &str {
        &self.config.job_key
    }

    async fn tick(&self) {
        if let Err(e) = self.run().await {
            error!(job = %self.config.job_key, error = %e, "promotion job failed");
        }
    }
}
