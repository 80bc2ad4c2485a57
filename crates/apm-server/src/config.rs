use serde::Deserialize;
use std::path::Path;

use apm_core::{DataSource, JobConfig, KvConfig, StoreConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // General
    #[serde(default)]
    pub general: GeneralConfig,

    // Backends
    pub store: StoreConfig,
    #[serde(default)]
    pub kv: KvConfig,

    // Promotion job
    #[serde(default)]
    pub job: JobConfig,

    // Health probe
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// `text` or `json`
    pub log_format: String,
    pub shutdown_timeout_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Load the TOML file, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("can't read config {}: {}", path.display(), e))?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides for endpoints and secrets, looked up by variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CLICKHOUSE_CONNECTION_URL") {
            self.store.connection_url = url;
        }
        if let Some(username) = lookup("CLICKHOUSE_USER_NAME") {
            self.store.username = username;
        }
        if let Some(password) = lookup("CLICKHOUSE_PASSWORD") {
            self.store.password = password;
        }
        if let Some(sources) = lookup("CLICKHOUSE_DATA_SOURCES") {
            self.store.data_sources = sources;
        }
        if let Some(max) = lookup("CLICKHOUSE_MAX_CONNECTIONS") {
            self.store.max_connections = max
                .parse()
                .map_err(|_| anyhow::anyhow!("CLICKHOUSE_MAX_CONNECTIONS is not a number: {}", max))?;
        }
        if let Some(host) = lookup("REDIS_HOST") {
            self.kv.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT") {
            self.kv.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("REDIS_PORT is not a port: {}", port))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.store.validate()?;
        self.job.validate()?;
        for id in self.store.data_source_ids() {
            DataSource::resolve(&id, &self.store)?;
        }
        if !matches!(self.general.log_format.as_str(), "text" | "json") {
            anyhow::bail!("general.log_format must be 'text' or 'json'");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [store]
        connection_url = "http://{username}:{password}@{clickhouse_host}:8123/{database}"
        data_sources = "tcp://ch-1:9000/signoz,tcp://ch-2:9000/signoz"
    "#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let file = write_config(MINIMAL);
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.store.max_connections, 10);
        assert_eq!(config.store.tables.final_spans, "signoz_index_final");
        assert_eq!(config.job.job_key, "TRACE_FILTER");
        assert_eq!(config.job.interval_secs, 60);
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.general.log_format, "text");
    }

    #[test]
    fn test_sections_override_defaults() {
        let file = write_config(&format!(
            "{}\n{}",
            MINIMAL,
            r#"
            [general]
            log_level = "debug"
            log_format = "json"

            [kv]
            host = "redis.internal"
            pool_size = 8

            [job]
            interval_secs = 30
            lock_ttl_secs = 90
            "#
        ));
        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.kv.host, "redis.internal");
        assert_eq!(config.kv.port, 6379);
        assert_eq!(config.kv.pool_size, 8);
        assert_eq!(config.job.interval_secs, 30);
        assert_eq!(config.job.lock_ttl_secs, 90);
        assert_eq!(config.job.grace_secs, 300);
    }

    #[test]
    fn test_environment_overrides() {
        let mut config: Config = toml::from_str(MINIMAL).unwrap();
        let env: HashMap<&str, &str> = [
            ("CLICKHOUSE_DATA_SOURCES", "tcp://ch-9:9000/other"),
            ("CLICKHOUSE_PASSWORD", "s3cret"),
            ("CLICKHOUSE_MAX_CONNECTIONS", "4"),
            ("REDIS_PORT", "6380"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.store.data_source_ids(), vec!["tcp://ch-9:9000/other"]);
        assert_eq!(config.store.password, "s3cret");
        assert_eq!(config.store.max_connections, 4);
        assert_eq!(config.kv.port, 6380);
        assert_eq!(config.kv.host, "127.0.0.1");

        let bad_port = config.apply_overrides(|name| (name == "REDIS_PORT").then(|| "redis".to_string()));
        assert!(bad_port.is_err());
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let malformed = MINIMAL.replace("tcp://ch-2:9000/signoz", "ch-2");
        assert!(Config::load(write_config(&malformed).path()).is_err());

        let no_sources = MINIMAL.replace("tcp://ch-1:9000/signoz,tcp://ch-2:9000/signoz", " ");
        assert!(Config::load(write_config(&no_sources).path()).is_err());

        let zero_interval = format!("{}\n[job]\ninterval_secs = 0\n", MINIMAL);
        assert!(Config::load(write_config(&zero_interval).path()).is_err());
    }
}
