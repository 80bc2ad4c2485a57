#![allow(dead_code)]

use std::sync::Arc;

use apm_core::store::{MockConnector, MockStore};
use apm_core::{DataSourceRegistry, QueryExecutor, StoreConfig, TableNames};

pub const PRIMARY: &str = "tcp://ch-1:9000/signoz";
pub const SECONDARY: &str = "tcp://ch-2:9000/signoz";
pub const TERTIARY: &str = "tcp://ch-3:9000/signoz";

pub fn store_config(sources: &[&str]) -> StoreConfig {
    StoreConfig {
        connection_url: "http://{username}:{password}@{clickhouse_host}:8123/{database}".to_string(),
        username: "reader".to_string(),
        password: "secret".to_string(),
        data_sources: sources.join(","),
        max_connections: 10,
        connection_lifetime_secs: 3600,
        request_timeout_secs: 30,
        tables: TableNames::default(),
    }
}

/// A registry over `sources`, each scripted on `store` and registered in order
pub async fn executor(store: &Arc<MockStore>, sources: &[&str]) -> Arc<QueryExecutor> {
    for source in sources {
        store.endpoint(source);
    }
    let registry = Arc::new(DataSourceRegistry::new(
        store_config(sources),
        Arc::new(MockConnector::new(store.clone())),
    ));
    registry.connect().await;
    Arc::new(QueryExecutor::new(registry))
}
