//! ClickHouse HTTP interface connection
//!
//! Statements are POSTed to the endpoint; positional `?` placeholders are
//! rewritten into typed server-side parameters (`{p1:String}`) whose values
//! travel as `param_p1` query arguments. Rows come back as `JSONEachRow`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Url;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{placeholder_positions, Connector, Param, Row, Statement, StoreConnection, StoreError, StoreTransaction};
use crate::config::StoreConfig;
use crate::registry::DataSource;

/// Opens [`ClickHouseConnection`]s with the configured pool limits
pub struct ClickHouseConnector {
    max_connections: usize,
    connection_lifetime: Duration,
    request_timeout: Duration,
}

impl ClickHouseConnector {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            connection_lifetime: config.connection_lifetime(),
            request_timeout: config.request_timeout(),
        }
    }
}

#[async_trait]
impl Connector for ClickHouseConnector {
    async fn open(&self, source: &DataSource) -> Result<Arc<dyn StoreConnection>, StoreError> {
        let connection_error = |message: String| StoreError::Connection {
            endpoint: source.id.clone(),
            message,
        };

        let url = Url::parse(&source.url).map_err(|e| connection_error(e.to_string()))?;
        let database = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|db| !db.is_empty())
            .unwrap_or("default")
            .to_string();
        let user = url.username().to_string();
        let password = url.password().unwrap_or_default().to_string();

        let mut base = url.clone();
        base.set_path("/");
        base.set_query(None);
        base.set_username("").map_err(|_| connection_error("cannot strip username".to_string()))?;
        base.set_password(None).map_err(|_| connection_error("cannot strip password".to_string()))?;

        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(self.max_connections)
            .pool_idle_timeout(self.connection_lifetime)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| connection_error(e.to_string()))?;

        Ok(Arc::new(ClickHouseConnection {
            inner: Arc::new(Inner {
                endpoint: source.id.clone(),
                base,
                database,
                user,
                password,
                client,
                limiter: ConnectionLimiter::new(self.max_connections),
            }),
        }))
    }
}

/// Bounds concurrent requests against one endpoint
struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
}

impl ConnectionLimiter {
    fn new(max_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    async fn acquire(&self, endpoint: &str) -> Result<OwnedSemaphorePermit, StoreError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Connection {
                endpoint: endpoint.to_string(),
                message: "connection limiter closed".to_string(),
            })
    }
}

struct Inner {
    endpoint: String,
    base: Url,
    database: String,
    user: String,
    password: String,
    client: reqwest::Client,
    limiter: ConnectionLimiter,
}

impl Inner {
    async fn post(&self, sql: &str, params: &[Param]) -> Result<String, StoreError> {
        let (sql, bound) = bind_params(sql, params)?;
        let _permit = self.limiter.acquire(&self.endpoint).await?;

        let mut query = session_settings(&self.database);
        query.extend(bound);

        let mut request = self.client.post(self.base.clone()).query(&query).body(sql);
        if !self.user.is_empty() {
            request = request
                .header("X-ClickHouse-User", &self.user)
                .header("X-ClickHouse-Key", &self.password);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(StoreError::Query {
                endpoint: self.endpoint.clone(),
                message: format!("{}: {}", status, body.trim()),
            });
        }
        Ok(body)
    }

    fn transport_error(&self, e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(self.endpoint.clone())
        } else {
            StoreError::Connection {
                endpoint: self.endpoint.clone(),
                message: e.to_string(),
            }
        }
    }
}

/// Connection to one ClickHouse endpoint over HTTP
#[derive(Clone)]
pub struct ClickHouseConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl StoreConnection for ClickHouseConnection {
    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut url = self.inner.base.clone();
        url.set_path("/ping");
        let response = self
            .inner
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.inner.transport_error(e))?;
        if !response.status().is_success() {
            return Err(StoreError::Connection {
                endpoint: self.inner.endpoint.clone(),
                message: format!("ping returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn select(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, StoreError> {
        let body = self.inner.post(sql, params).await?;
        parse_json_each_row(&self.inner.endpoint, &body)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(ClickHouseTransaction {
            inner: self.inner.clone(),
        }))
    }
}

/// Buffers bound executions and sends them on commit.
///
/// The HTTP interface has no transactions: commit POSTs the executions one
/// by one, and those sent before a failing one stay applied.
struct ClickHouseTransaction {
    inner: Arc<Inner>,
}

#[async_trait]
impl StoreTransaction for ClickHouseTransaction {
    fn prepare(&mut self, sql: &str) -> Result<Statement, StoreError> {
        if sql.trim().is_empty() {
            return Err(StoreError::Query {
                endpoint: self.inner.endpoint.clone(),
                message: "empty statement".to_string(),
            });
        }
        Ok(Statement::new(sql))
    }

    async fn commit(self: Box<Self>, statement: Statement) -> Result<(), StoreError> {
        let sql = statement.sql().to_string();
        let executions = statement.into_executions();
        let total = executions.len();
        for (sent, params) in executions.iter().enumerate() {
            if let Err(e) = self.inner.post(&sql, params).await {
                if sent > 0 {
                    warn!(
                        endpoint = %self.inner.endpoint,
                        applied = sent,
                        total,
                        "execution failed after earlier ones were applied"
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        debug!(endpoint = %self.inner.endpoint, "discarding uncommitted statement");
    }
}

/// Settings sent with every statement. `DateTime` values render in UTC
/// whatever the server's own timezone, matching [`parse_store_datetime`].
///
/// [`parse_store_datetime`]: crate::time::parse_store_datetime
pub fn session_settings(database: &str) -> Vec<(String, String)> {
    vec![
        ("database".to_string(), database.to_string()),
        ("default_format".to_string(), "JSONEachRow".to_string()),
        ("output_format_json_quote_64bit_integers".to_string(), "0".to_string()),
        ("session_timezone".to_string(), "UTC".to_string()),
    ]
}

/// Rewrite `?` placeholders into typed ClickHouse parameters.
///
/// Returns the rewritten statement and the `param_<name>` query arguments.
pub fn bind_params(sql: &str, params: &[Param]) -> Result<(String, Vec<(String, String)>), StoreError> {
    let positions = placeholder_positions(sql);
    if positions.len() != params.len() {
        return Err(StoreError::Bind(format!(
            "statement has {} placeholders, got {} parameters",
            positions.len(),
            params.len()
        )));
    }

    let mut rewritten = String::with_capacity(sql.len() + params.len() * 16);
    let mut bound = Vec::with_capacity(params.len());
    let mut last = 0;
    for (idx, (pos, param)) in positions.iter().zip(params).enumerate() {
        let name = format!("p{}", idx + 1);
        rewritten.push_str(&sql[last..*pos]);
        rewritten.push_str(&format!("{{{}:{}}}", name, type_name(param)));
        bound.push((format!("param_{}", name), render(param)));
        last = pos + 1;
    }
    rewritten.push_str(&sql[last..]);
    Ok((rewritten, bound))
}

fn type_name(param: &Param) -> &'static str {
    match param {
        Param::Str(_) => "String",
        Param::Int(_) => "Int64",
        Param::UInt(_) => "UInt64",
        Param::Float(_) => "Float64",
        Param::DateTime(_) => "DateTime('UTC')",
        Param::DateTime64(_) => "DateTime64(9, 'UTC')",
    }
}

fn render(param: &Param) -> String {
    match param {
        Param::Str(s) => escape(s),
        Param::Int(v) => v.to_string(),
        Param::UInt(v) => v.to_string(),
        Param::Float(v) => v.to_string(),
        Param::DateTime(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| secs.to_string()),
        Param::DateTime64(nanos) => Utc
            .timestamp_nanos(*nanos)
            .format("%Y-%m-%d %H:%M:%S%.9f")
            .to_string(),
    }
}

/// Parameter values use the escaped text format
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

fn parse_json_each_row(endpoint: &str, body: &str) -> Result<Vec<Row>, StoreError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(row)) => Ok(row),
            Ok(other) => Err(StoreError::Response {
                endpoint: endpoint.to_string(),
                message: format!("expected object row, got {}", other),
            }),
            Err(e) => Err(StoreError::Response {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use warp::Filter;

    #[test]
    fn test_bind_params_rewrites_placeholders() {
        let (sql, bound) = bind_params(
            "SELECT name FROM t WHERE a = ? AND note = 'why?' AND ts >= ?",
            &[Param::from("svc"), Param::DateTime(0)],
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT name FROM t WHERE a = {p1:String} AND note = 'why?' AND ts >= {p2:DateTime('UTC')}"
        );
        assert_eq!(bound[0], ("param_p1".to_string(), "svc".to_string()));
        assert_eq!(bound[1], ("param_p2".to_string(), "1970-01-01 00:00:00".to_string()));
    }

    #[test]
    fn test_session_renders_datetimes_in_utc() {
        let settings = session_settings("signoz");
        assert!(settings.contains(&("session_timezone".to_string(), "UTC".to_string())));
        assert!(settings.contains(&("database".to_string(), "signoz".to_string())));
        assert!(settings.contains(&("default_format".to_string(), "JSONEachRow".to_string())));
    }

    #[test]
    fn test_bind_params_arity_mismatch() {
        assert!(matches!(
            bind_params("SELECT ?", &[]),
            Err(StoreError::Bind(_))
        ));
    }

    #[test]
    fn test_render_escapes_and_nanos() {
        assert_eq!(render(&Param::from("a\tb\\c")), "a\\tb\\\\c");
        assert_eq!(
            render(&Param::DateTime64(1_500_000_000)),
            "1970-01-01 00:00:01.500000000"
        );
    }

    #[test]
    fn test_parse_json_each_row() {
        let rows = parse_json_each_row("ch", "{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["a"], serde_json::json!(2));
        assert!(parse_json_each_row("ch", "[1]").is_err());
    }

    /// Serves `POST /` like the HTTP interface: answers each statement with
    /// an empty body, or 500 when its first parameter is `fail`
    fn stub_server() -> (std::net::SocketAddr, Arc<parking_lot::Mutex<Vec<HashMap<String, String>>>>) {
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = received.clone();
        let route = warp::post()
            .and(warp::query::<HashMap<String, String>>())
            .map(move |query: HashMap<String, String>| {
                let status = if query.get("param_p1").map(String::as_str) == Some("fail") {
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    warp::http::StatusCode::OK
                };
                log.lock().push(query);
                warp::reply::with_status(String::new(), status)
            });
        let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (addr, received)
    }

    async fn connect(addr: std::net::SocketAddr) -> Arc<dyn StoreConnection> {
        let config = StoreConfig {
            connection_url: "http://{clickhouse_host}/{database}".to_string(),
            username: String::new(),
            password: String::new(),
            data_sources: "tcp://stub:9000/signoz".to_string(),
            max_connections: 2,
            connection_lifetime_secs: 60,
            request_timeout_secs: 5,
            tables: Default::default(),
        };
        let source = DataSource {
            id: "tcp://stub:9000/signoz".to_string(),
            url: format!("http://{}/signoz", addr),
        };
        ClickHouseConnector::new(&config).open(&source).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_stops_at_first_failed_execution() {
        let (addr, received) = stub_server();
        let connection = connect(addr).await;

        let mut tx = connection.begin().await.unwrap();
        let mut statement = tx.prepare("INSERT INTO t (name) VALUES (?)").unwrap();
        for name in ["first", "fail", "never"] {
            statement.exec(vec![Param::from(name)]).unwrap();
        }
        let err = tx.commit(statement).await.unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));

        // The first execution stays applied; the one after the failure is never sent
        let received = received.lock();
        let sent: Vec<&str> = received.iter().map(|q| q["param_p1"].as_str()).collect();
        assert_eq!(sent, vec!["first", "fail"]);
        assert!(received
            .iter()
            .all(|q| q.get("session_timezone").map(String::as_str) == Some("UTC")));
        assert_eq!(received[0]["database"], "signoz");
    }
}
