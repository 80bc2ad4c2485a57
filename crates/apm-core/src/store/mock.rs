//! Scripted in-process store for tests and dry runs.
//!
//! Every endpoint registered on a [`MockStore`] answers selects and writes
//! through caller-supplied responders. All traffic is recorded in order so
//! callers can assert on fallback order, bound parameters and write effects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Connector, Param, Row, Statement, StoreConnection, StoreError, StoreTransaction};
use crate::registry::DataSource;

/// What a scripted endpoint returns for a select
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Rows(Vec<Row>),
    Empty,
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCallKind {
    Select,
    Write,
}

/// One statement that reached an endpoint
#[derive(Debug, Clone)]
pub struct MockCall {
    pub endpoint: String,
    pub kind: MockCallKind,
    pub sql: String,
    pub params: Vec<Param>,
    pub succeeded: bool,
}

type SelectResponder = Arc<dyn Fn(&str, &[Param]) -> MockOutcome + Send + Sync>;
type WriteResponder = Arc<dyn Fn(&str, &[Param]) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
struct EndpointScript {
    open_error: Option<String>,
    ping_error: Option<String>,
    select: SelectResponder,
    write: WriteResponder,
}

impl Default for EndpointScript {
    fn default() -> Self {
        Self {
            open_error: None,
            ping_error: None,
            select: Arc::new(|_, _| MockOutcome::Empty),
            write: Arc::new(|_, _| Ok(())),
        }
    }
}

#[derive(Default)]
pub struct MockStore {
    scripts: Mutex<HashMap<String, EndpointScript>>,
    calls: Mutex<Vec<MockCall>>,
    opened: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint that answers every select with zero rows
    pub fn endpoint(&self, id: &str) {
        self.scripts.lock().entry(id.to_string()).or_default();
    }

    pub fn on_select<F>(&self, id: &str, responder: F)
    where
        F: Fn(&str, &[Param]) -> MockOutcome + Send + Sync + 'static,
    {
        self.scripts.lock().entry(id.to_string()).or_default().select = Arc::new(responder);
    }

    pub fn on_write<F>(&self, id: &str, responder: F)
    where
        F: Fn(&str, &[Param]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.scripts.lock().entry(id.to_string()).or_default().write = Arc::new(responder);
    }

    pub fn fail_open(&self, id: &str, message: &str) {
        self.scripts.lock().entry(id.to_string()).or_default().open_error = Some(message.to_string());
    }

    pub fn fail_ping(&self, id: &str, message: &str) {
        self.scripts.lock().entry(id.to_string()).or_default().ping_error = Some(message.to_string());
    }

    /// Every statement that reached an endpoint, in arrival order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn writes(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == MockCallKind::Write)
            .collect()
    }

    /// Endpoints that received a select, in order
    pub fn select_order(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.kind == MockCallKind::Select)
            .map(|c| c.endpoint)
            .collect()
    }

    /// Data sources the connector was asked to open, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    fn script(&self, id: &str) -> Option<EndpointScript> {
        self.scripts.lock().get(id).cloned()
    }

    fn record(&self, endpoint: &str, kind: MockCallKind, sql: &str, params: &[Param], succeeded: bool) {
        self.calls.lock().push(MockCall {
            endpoint: endpoint.to_string(),
            kind,
            sql: sql.to_string(),
            params: params.to_vec(),
            succeeded,
        });
    }
}

/// Opens [`MockConnection`]s for endpoints scripted on a [`MockStore`]
pub struct MockConnector {
    store: Arc<MockStore>,
}

impl MockConnector {
    pub fn new(store: Arc<MockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, source: &DataSource) -> Result<Arc<dyn StoreConnection>, StoreError> {
        self.store.opened.lock().push(source.id.clone());
        match self.store.script(&source.id) {
            None => Err(StoreError::Connection {
                endpoint: source.id.clone(),
                message: "unknown endpoint".to_string(),
            }),
            Some(script) if script.open_error.is_some() => Err(StoreError::Connection {
                endpoint: source.id.clone(),
                message: script.open_error.unwrap_or_default(),
            }),
            Some(_) => Ok(Arc::new(MockConnection {
                endpoint: source.id.clone(),
                store: self.store.clone(),
            })),
        }
    }
}

pub struct MockConnection {
    endpoint: String,
    store: Arc<MockStore>,
}

#[async_trait]
impl StoreConnection for MockConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.store.script(&self.endpoint).and_then(|s| s.ping_error) {
            Some(message) => Err(StoreError::Connection {
                endpoint: self.endpoint.clone(),
                message,
            }),
            None => Ok(()),
        }
    }

    async fn select(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, StoreError> {
        let script = self.store.script(&self.endpoint).unwrap_or_default();
        let outcome = (script.select)(sql, params);
        let succeeded = !matches!(outcome, MockOutcome::Fail(_));
        self.store.record(&self.endpoint, MockCallKind::Select, sql, params, succeeded);
        match outcome {
            MockOutcome::Rows(rows) => Ok(rows),
            MockOutcome::Empty => Err(StoreError::EmptyResult),
            MockOutcome::Fail(message) => Err(StoreError::Query {
                endpoint: self.endpoint.clone(),
                message,
            }),
        }
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MockTransaction {
            endpoint: self.endpoint.clone(),
            store: self.store.clone(),
        }))
    }
}

struct MockTransaction {
    endpoint: String,
    store: Arc<MockStore>,
}

#[async_trait]
impl StoreTransaction for MockTransaction {
    fn prepare(&mut self, sql: &str) -> Result<Statement, StoreError> {
        Ok(Statement::new(sql))
    }

    async fn commit(self: Box<Self>, statement: Statement) -> Result<(), StoreError> {
        let script = self.store.script(&self.endpoint).unwrap_or_default();
        let sql = statement.sql().to_string();
        for params in statement.into_executions() {
            let result = (script.write)(&sql, &params);
            self.store
                .record(&self.endpoint, MockCallKind::Write, &sql, &params, result.is_ok());
            result.map_err(|message| StoreError::Query {
                endpoint: self.endpoint.clone(),
                message,
            })?;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {}
}

/// Build a row from `(column, value)` pairs
pub fn row<I, K>(columns: I) -> Row
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    columns.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
