use serde::Deserialize;
use std::time::Duration;

use crate::{Error, Result};

/// Analytical store endpoints and pool limits
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Connection URL template with `{clickhouse_host}`, `{username}`,
    /// `{password}` and `{database}` placeholders
    pub connection_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Comma-separated data source identifiers, e.g.
    /// `tcp://ch-1:9000/signoz?debug=false,tcp://ch-2:9000/signoz`
    pub data_sources: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connection_lifetime_secs")]
    pub connection_lifetime_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub tables: TableNames,
}

fn default_max_connections() -> usize {
    10
}

fn default_connection_lifetime_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl StoreConfig {
    pub fn connection_lifetime(&self) -> Duration {
        Duration::from_secs(self.connection_lifetime_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Data source identifiers in configuration order, blanks dropped
    pub fn data_source_ids(&self) -> Vec<String> {
        self.data_sources
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_url.trim().is_empty() {
            return Err(Error::Config("store.connection_url is empty".to_string()));
        }
        if self.data_source_ids().is_empty() {
            return Err(Error::Config("store.data_sources lists no data source".to_string()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("store.max_connections must be positive".to_string()));
        }
        self.tables.validate()
    }
}

/// Table names of the fixed logical schema
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TableNames {
    pub aggregated: String,
    pub final_spans: String,
    pub staging_spans: String,
    pub watermark: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            aggregated: "signoz_index_aggregated".to_string(),
            final_spans: "signoz_index_final".to_string(),
            staging_spans: "signoz_index_tmp".to_string(),
            watermark: "last_success".to_string(),
        }
    }
}

impl TableNames {
    /// Names are spliced into statement text: plain identifiers only,
    /// optionally `database.table`
    pub fn validate(&self) -> Result<()> {
        for name in [&self.aggregated, &self.final_spans, &self.staging_spans, &self.watermark] {
            let plain = !name.is_empty()
                && name.split('.').all(|part| {
                    !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                });
            if !plain {
                return Err(Error::Config(format!("'{}' is not a valid table name", name)));
            }
        }
        Ok(())
    }
}

/// Key-value store used for the promotion lock
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub pool_size: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            pool_size: 4,
        }
    }
}

impl KvConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Upper bound for the job's grace and lookback windows
pub const MAX_JOB_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Promotion job timing and thresholds
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub job_key: String,
    pub grace_secs: u64,
    pub lookback_secs: u64,
    pub slow_threshold_ms: u64,
    pub lock_ttl_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            job_key: "TRACE_FILTER".to_string(),
            grace_secs: 5 * 60,
            lookback_secs: 20 * 60,
            slow_threshold_ms: 2_000,
            lock_ttl_secs: 120,
        }
    }
}

impl JobConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// How long a watermark must be in the past before the next promotion
    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs.min(MAX_JOB_WINDOW_SECS) as i64)
    }

    /// How far before the watermark a promotion starts
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookback_secs.min(MAX_JOB_WINDOW_SECS) as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config("job.interval_secs must be positive".to_string()));
        }
        if self.lock_ttl_secs == 0 {
            return Err(Error::Config("job.lock_ttl_secs must be positive".to_string()));
        }
        if self.job_key.is_empty() {
            return Err(Error::Config("job.job_key is empty".to_string()));
        }
        for (name, secs) in [("grace_secs", self.grace_secs), ("lookback_secs", self.lookback_secs)] {
            if secs > MAX_JOB_WINDOW_SECS {
                return Err(Error::Config(format!(
                    "job.{} must be at most {} seconds, got {}",
                    name, MAX_JOB_WINDOW_SECS, secs
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(data_sources: &str) -> StoreConfig {
        StoreConfig {
            connection_url: "http://{clickhouse_host}:8123/{database}".to_string(),
            username: String::new(),
            password: String::new(),
            data_sources: data_sources.to_string(),
            max_connections: 10,
            connection_lifetime_secs: 3600,
            request_timeout_secs: 30,
            tables: TableNames::default(),
        }
    }

    #[test]
    fn test_data_source_ids_keep_order_and_skip_blanks() {
        let config = store("tcp://a:9000/db, ,tcp://b:9000/db,");
        assert_eq!(config.data_source_ids(), vec!["tcp://a:9000/db", "tcp://b:9000/db"]);
    }

    #[test]
    fn test_validate_rejects_empty_sources() {
        assert!(matches!(store(" , ").validate(), Err(Error::Config(_))));
        assert!(store("tcp://a:9000/db").validate().is_ok());
    }

    #[test]
    fn test_table_names_must_be_identifiers() {
        let mut config = store("tcp://a:9000/db");
        config.tables.final_spans = "signoz.signoz_index_final".to_string();
        assert!(config.validate().is_ok());

        config.tables.watermark = "last_success; DROP TABLE x".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_job_defaults() {
        let job = JobConfig::default();
        assert_eq!(job.job_key, "TRACE_FILTER");
        assert_eq!(job.grace_secs, 300);
        assert_eq!(job.lookback_secs, 1200);
        assert_eq!(job.lock_ttl_secs, 120);
        assert_eq!(job.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_job_windows_are_bounded() {
        let job = JobConfig {
            grace_secs: u64::MAX,
            ..JobConfig::default()
        };
        assert!(matches!(job.validate(), Err(Error::Config(_))));
        assert_eq!(job.grace(), chrono::Duration::seconds(MAX_JOB_WINDOW_SECS as i64));

        let job = JobConfig {
            lookback_secs: MAX_JOB_WINDOW_SECS + 1,
            ..JobConfig::default()
        };
        assert!(matches!(job.validate(), Err(Error::Config(_))));

        let job = JobConfig {
            grace_secs: MAX_JOB_WINDOW_SECS,
            lookback_secs: MAX_JOB_WINDOW_SECS,
            ..JobConfig::default()
        };
        assert!(job.validate().is_ok());
        assert_eq!(JobConfig::default().lookback(), chrono::Duration::minutes(20));
    }

    #[test]
    fn test_kv_url() {
        let kv = KvConfig::default();
        assert_eq!(kv.url(), "redis://127.0.0.1:6379/0");
    }
}
