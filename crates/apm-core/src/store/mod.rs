//! Analytical store access seam
//!
//! A [`StoreConnection`] is one live handle to one store endpoint. Reads go
//! through [`StoreConnection::select`]; writes open a [`StoreTransaction`],
//! prepare a [`Statement`], bind one or more executions and commit.
//! Every value travels as a bound [`Param`]; statement text only ever carries
//! positional `?` placeholders.

pub mod clickhouse;
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::DataSource;

pub use clickhouse::{ClickHouseConnection, ClickHouseConnector};
pub use mock::{MockConnector, MockOutcome, MockStore};

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Per-endpoint store failure
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Connection error on {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Query error on {endpoint}: {message}")]
    Query { endpoint: String, message: String },

    #[error("Request timed out on {0}")]
    Timeout(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Malformed response from {endpoint}: {message}")]
    Response { endpoint: String, message: String },

    /// Zero rows where one was asked for; callers treat this as success
    #[error("No rows in result set")]
    EmptyResult,
}

/// A value bound to a `?` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Seconds since the epoch, for `DateTime` columns
    DateTime(i64),
    /// Nanoseconds since the epoch, for `DateTime64(9)` columns
    DateTime64(i64),
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Str(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Str(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<u64> for Param {
    fn from(value: u64) -> Self {
        Param::UInt(value)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Float(value)
    }
}

/// Byte offsets of every `?` placeholder outside quoted literals
pub fn placeholder_positions(sql: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut in_literal = false;
    let mut escaped = false;
    for (idx, ch) in sql.char_indices() {
        if in_literal {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '\'' => in_literal = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '\'' => in_literal = true,
            '?' => positions.push(idx),
            _ => {}
        }
    }
    positions
}

/// A prepared write statement and the executions bound to it
#[derive(Debug, Clone)]
pub struct Statement {
    sql: String,
    placeholders: usize,
    executions: Vec<Vec<Param>>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let placeholders = placeholder_positions(&sql).len();
        Self {
            sql,
            placeholders,
            executions: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bind one execution of the statement
    pub fn exec(&mut self, params: Vec<Param>) -> Result<(), StoreError> {
        if params.len() != self.placeholders {
            return Err(StoreError::Bind(format!(
                "statement expects {} parameters, got {}",
                self.placeholders,
                params.len()
            )));
        }
        self.executions.push(params);
        Ok(())
    }

    pub fn executions(&self) -> &[Vec<Param>] {
        &self.executions
    }

    pub fn into_executions(self) -> Vec<Vec<Param>> {
        self.executions
    }
}

/// A live handle to one store endpoint
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Identity of the endpoint in logs and fallback order
    fn endpoint(&self) -> &str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn select(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Write unit on one endpoint: nothing is applied until commit
#[async_trait]
pub trait StoreTransaction: Send {
    fn prepare(&mut self, sql: &str) -> Result<Statement, StoreError>;

    /// Apply every bound execution. Atomicity is up to the backend: an
    /// error may leave earlier executions applied.
    async fn commit(self: Box<Self>, statement: Statement) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>);
}

/// Opens connections for configured data sources
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, source: &DataSource) -> Result<Arc<dyn StoreConnection>, StoreError>;
}

/// Lenient decoders for store rows: 64-bit integers may arrive quoted and
/// aggregate floats may arrive as `null` or `"nan"`.
pub(crate) mod de {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn f64_lenient<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
            Value::String(s) => s.parse::<f64>().unwrap_or(f64::NAN),
            _ => f64::NAN,
        })
    }

    pub fn u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().map(|f| f as u64))
                .ok_or_else(|| serde::de::Error::custom(format!("not an unsigned integer: {}", n))),
            Value::String(s) => s.parse::<u64>().map_err(serde::de::Error::custom),
            Value::Null => Ok(0),
            other => Err(serde::de::Error::custom(format!("not an unsigned integer: {}", other))),
        }
    }

    pub fn i64_lenient<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| serde::de::Error::custom(format!("not an integer: {}", n))),
            Value::String(s) => s.parse::<i64>().map_err(serde::de::Error::custom),
            Value::Null => Ok(0),
            other => Err(serde::de::Error::custom(format!("not an integer: {}", other))),
        }
    }

    pub fn string_or_default<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_skip_literals() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = 'what?' AND c = 'it\\'s?' AND d = ?";
        let positions = placeholder_positions(sql);
        assert_eq!(positions.len(), 2);
        assert_eq!(&sql[positions[1]..], "?");
    }

    #[test]
    fn test_statement_checks_arity() {
        let mut stmt = Statement::new("INSERT INTO t VALUES (?, ?)");
        assert!(stmt.exec(vec![Param::from("a")]).is_err());
        stmt.exec(vec![Param::from("a"), Param::Int(1)]).unwrap();
        assert_eq!(stmt.executions().len(), 1);
    }

    #[test]
    fn test_lenient_decoding() {
        #[derive(serde::Deserialize)]
        struct Sample {
            #[serde(deserialize_with = "de::u64_lenient")]
            calls: u64,
            #[serde(deserialize_with = "de::f64_lenient")]
            p99: f64,
        }
        let sample: Sample =
            serde_json::from_value(serde_json::json!({"calls": "42", "p99": null})).unwrap();
        assert_eq!(sample.calls, 42);
        assert!(sample.p99.is_nan());
    }
}
