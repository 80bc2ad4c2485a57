//! APM reporting core
//!
//! Data access and background processing for the APM reporting service:
//! - **Store access**: a registry of analytical store endpoints and an executor
//!   that fans reads and writes out across them with ordered fallback
//! - **Trace promotion**: a watermark-driven, lock-coordinated job that keeps
//!   erroring and slow traces from the staging table
//! - **Reports**: time-bucketed aggregate queries merged into response rows,
//!   span search and the service dependency map

pub mod config;
pub mod dependencies;
pub mod executor;
pub mod health;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod params;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod time;

pub use config::{JobConfig, KvConfig, StoreConfig, TableNames};
pub use dependencies::{DependencyEdge, DependencyGraphBuilder};
pub use executor::{FallbackPolicy, QueryExecutor};
pub use health::HealthChecker;
pub use job::{JobOutcome, RetentionPolicy, WatermarkPromotionJob};
pub use lock::{LockCoordinator, LockError, MemoryLockCoordinator, RedisLockCoordinator};
pub use metrics::MetricsAggregationEngine;
pub use registry::{DataSource, DataSourceRegistry};
pub use scheduler::{PeriodicJob, Scheduler, Shutdown};
pub use store::{Param, Row, StoreConnection, StoreError};
pub use time::{MockProvider, SystemProvider, TimeProvider};

use thiserror::Error;

/// Stage of a promotion job invocation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    ReadWatermark,
    Promote,
    AdvanceWatermark,
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStage::ReadWatermark => write!(f, "read watermark"),
            JobStage::Promote => write!(f, "promote records"),
            JobStage::AdvanceWatermark => write!(f, "advance watermark"),
        }
    }
}

/// Core error type for store access, reports and the promotion job
#[derive(Error, Debug)]
pub enum Error {
    /// Caller error, raised before any store is contacted
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Query failed on all {attempts} data sources: {query}: {source}")]
    Exhausted {
        query: String,
        attempts: usize,
        #[source]
        source: StoreError,
    },

    #[error("No data sources registered")]
    NoEndpoints,

    #[error("Unexpected row shape: {0}")]
    Decode(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Promotion job failed to {stage}: {source}")]
    Job {
        stage: JobStage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn job(stage: JobStage, source: Error) -> Self {
        Error::Job {
            stage,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
