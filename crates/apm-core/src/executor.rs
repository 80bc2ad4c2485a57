//! Resilient query execution across registered data sources
//!
//! Callers never see individual endpoints: a read walks the registry newest
//! first and returns the first answer, a write walks it oldest first and
//! stops at the first endpoint that commits.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::registry::DataSourceRegistry;
use crate::store::{Param, Row, Statement, StoreConnection, StoreError};
use crate::{Error, Result};

/// Order in which endpoints are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Most recently registered endpoint first; the bootstrap endpoint is the
    /// last resort
    ReadPreferLatest,
    /// Registration order; the bootstrap endpoint takes every write it accepts
    WritePreferPrimary,
}

impl FallbackPolicy {
    pub fn order<T>(&self, mut registered: Vec<T>) -> Vec<T> {
        if *self == FallbackPolicy::ReadPreferLatest {
            registered.reverse();
        }
        registered
    }
}

pub struct QueryExecutor {
    registry: Arc<DataSourceRegistry>,
}

impl QueryExecutor {
    pub fn new(registry: Arc<DataSourceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    async fn candidates(&self, policy: FallbackPolicy) -> Result<Vec<Arc<dyn StoreConnection>>> {
        let connections = self.registry.connections().await;
        if connections.is_empty() {
            return Err(Error::NoEndpoints);
        }
        Ok(policy.order(connections))
    }

    /// Run a read and return the raw rows of the first endpoint that answers.
    ///
    /// An empty result counts as an answer with zero rows.
    pub async fn select_rows(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>> {
        let candidates = self.candidates(FallbackPolicy::ReadPreferLatest).await?;
        let attempts = candidates.len();
        let mut last_error = None;

        for connection in candidates {
            match connection.select(sql, params).await {
                Ok(rows) => {
                    debug!(endpoint = %connection.endpoint(), rows = rows.len(), "read served");
                    return Ok(rows);
                }
                Err(StoreError::EmptyResult) => {
                    debug!(endpoint = %connection.endpoint(), "read served with no rows");
                    return Ok(Vec::new());
                }
                Err(e) => {
                    warn!(endpoint = %connection.endpoint(), query = %sql, error = %e, "read failed, trying next data source");
                    last_error = Some(e);
                }
            }
        }

        Err(exhausted(sql, attempts, last_error))
    }

    /// Run a read and decode every row into `T`
    pub async fn select<T: DeserializeOwned>(&self, sql: &str, params: &[Param]) -> Result<Vec<T>> {
        self.select_rows(sql, params)
            .await?
            .into_iter()
            .map(|row| decode(sql, row))
            .collect()
    }

    /// Run a single-row read; zero rows is `None`
    pub async fn select_one<T: DeserializeOwned>(&self, sql: &str, params: &[Param]) -> Result<Option<T>> {
        match self.select_rows(sql, params).await?.into_iter().next() {
            Some(row) => decode(sql, row).map(Some),
            None => Ok(None),
        }
    }

    /// Prepare `sql` on the first endpoint that accepts it, let `bind` add the
    /// executions and commit.
    ///
    /// Only one endpoint ends up with the write.
    pub async fn execute_write<F>(&self, sql: &str, bind: F) -> Result<()>
    where
        F: Fn(&mut Statement) -> std::result::Result<(), StoreError> + Send + Sync,
    {
        let candidates = self.candidates(FallbackPolicy::WritePreferPrimary).await?;
        let attempts = candidates.len();
        let mut last_error = None;

        for connection in candidates {
            let endpoint = connection.endpoint().to_string();
            let mut tx = match connection.begin().await {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(endpoint = %endpoint, query = %sql, error = %e, "can't begin write");
                    last_error = Some(e);
                    continue;
                }
            };

            let mut statement = match tx.prepare(sql) {
                Ok(statement) => statement,
                Err(e) => {
                    warn!(endpoint = %endpoint, query = %sql, error = %e, "can't prepare write");
                    tx.rollback().await;
                    last_error = Some(e);
                    continue;
                }
            };

            if let Err(e) = bind(&mut statement) {
                warn!(endpoint = %endpoint, query = %sql, error = %e, "can't bind write");
                tx.rollback().await;
                last_error = Some(e);
                continue;
            }

            match tx.commit(statement).await {
                Ok(()) => {
                    debug!(endpoint = %endpoint, "write committed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, query = %sql, error = %e, "write failed, trying next data source");
                    last_error = Some(e);
                }
            }
        }

        Err(exhausted(sql, attempts, last_error))
    }
}

fn exhausted(sql: &str, attempts: usize, last_error: Option<StoreError>) -> Error {
    match last_error {
        Some(source) => Error::Exhausted {
            query: sql.to_string(),
            attempts,
            source,
        },
        None => Error::NoEndpoints,
    }
}

fn decode<T: DeserializeOwned>(sql: &str, row: Row) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(row))
        .map_err(|e| Error::Decode(format!("{} ({})", e, sql)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_order() {
        let registered = vec!["a", "b", "c"];
        assert_eq!(FallbackPolicy::ReadPreferLatest.order(registered.clone()), vec!["c", "b", "a"]);
        assert_eq!(FallbackPolicy::WritePreferPrimary.order(registered), vec!["a", "b", "c"]);
    }
}
