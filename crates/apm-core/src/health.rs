//! Health checks for the analytical store and the lock backend

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::error;

use crate::lock::LockCoordinator;
use crate::registry::DataSourceRegistry;
use crate::time::TimeProvider;

pub const STATUS_UP: u16 = 200;
pub const STATUS_DOWN: u16 = 503;

#[derive(Clone, Debug, PartialEq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    pub latency_ms: f64,
}

impl HealthStatus {
    pub fn up(latency_ms: f64) -> Self {
        Self {
            healthy: true,
            message: "UP".to_string(),
            latency_ms,
        }
    }

    pub fn down(message: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            latency_ms,
        }
    }

    pub fn status_code(&self) -> u16 {
        if self.healthy {
            STATUS_UP
        } else {
            STATUS_DOWN
        }
    }
}

#[derive(Clone, Debug)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
}

/// One dependency the service reports on
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> HealthStatus;
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Pings the first registered store endpoint, at most once per interval;
/// in between the last result is reported again
pub struct StoreHealthCheck {
    registry: Arc<DataSourceRegistry>,
    clock: Arc<dyn TimeProvider>,
    interval: Duration,
    last: Mutex<Option<(DateTime<Utc>, HealthStatus)>>,
}

impl StoreHealthCheck {
    pub fn new(registry: Arc<DataSourceRegistry>, clock: Arc<dyn TimeProvider>) -> Self {
        Self::with_interval(registry, clock, Duration::minutes(10))
    }

    pub fn with_interval(registry: Arc<DataSourceRegistry>, clock: Arc<dyn TimeProvider>, interval: Duration) -> Self {
        Self {
            registry,
            clock,
            interval,
            last: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> HealthStatus {
        let now = self.clock.now();
        let cached = self.last.lock().clone();
        if let Some((at, status)) = cached {
            if now - at < self.interval {
                return status;
            }
        }

        let start = Instant::now();
        let status = match self.registry.snapshot().first() {
            // Nothing registered yet is not an outage of the store
            None => HealthStatus::up(0.0),
            Some(connection) => match connection.ping().await {
                Ok(()) => HealthStatus::up(elapsed_ms(start)),
                Err(e) => {
                    error!(endpoint = %connection.endpoint(), error = %e, "store health check failed");
                    HealthStatus::down(e.to_string(), elapsed_ms(start))
                }
            },
        };

        *self.last.lock() = Some((now, status.clone()));
        status
    }
}

/// Pings the lock backend on every check
pub struct KvHealthCheck {
    lock: Arc<dyn LockCoordinator>,
}

impl KvHealthCheck {
    pub fn new(lock: Arc<dyn LockCoordinator>) -> Self {
        Self { lock }
    }
}

#[async_trait]
impl HealthCheck for KvHealthCheck {
    fn name(&self) -> &str {
        "kv"
    }

    async fn check(&self) -> HealthStatus {
        let start = Instant::now();
        match self.lock.ping().await {
            Ok(()) => HealthStatus::up(elapsed_ms(start)),
            Err(e) => {
                error!(error = %e, "kv health check failed");
                HealthStatus::down(e.to_string(), elapsed_ms(start))
            }
        }
    }
}

/// Runs the registered checks and keeps their latest results
pub struct HealthChecker {
    checks: Vec<Arc<dyn HealthCheck>>,
    components: DashMap<String, ComponentHealth>,
    clock: Arc<dyn TimeProvider>,
}

impl HealthChecker {
    pub fn new(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            checks: Vec::new(),
            components: DashMap::new(),
            clock,
        }
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Record a component health status
    pub fn report(&self, name: &str, status: HealthStatus) {
        self.components.insert(
            name.to_string(),
            ComponentHealth {
                name: name.to_string(),
                status,
                last_check: self.clock.now(),
            },
        );
    }

    /// Run every check in registration order and record the results
    pub async fn run_checks(&self) {
        for check in &self.checks {
            let status = check.check().await;
            self.report(check.name(), status);
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.components.iter().all(|c| c.status.healthy)
    }

    /// Status code of the first failing check in registration order, else 200
    pub fn status_code(&self) -> u16 {
        self.get_all()
            .iter()
            .map(|c| c.status.status_code())
            .find(|code| *code != STATUS_UP)
            .unwrap_or(STATUS_UP)
    }

    /// Latest results in check registration order, then ad-hoc reports
    pub fn get_all(&self) -> Vec<ComponentHealth> {
        let mut all: Vec<ComponentHealth> = self
            .checks
            .iter()
            .filter_map(|check| self.components.get(check.name()).map(|c| c.value().clone()))
            .collect();
        let mut extra: Vec<ComponentHealth> = self
            .components
            .iter()
            .filter(|c| !self.checks.iter().any(|check| check.name() == c.key()))
            .map(|c| c.value().clone())
            .collect();
        extra.sort_by(|a, b| a.name.cmp(&b.name));
        all.extend(extra);
        all
    }

    pub fn to_json(&self) -> serde_json::Value {
        let components: Vec<serde_json::Value> = self
            .get_all()
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "status": if c.status.healthy { "UP" } else { "DOWN" },
                    "status_code": c.status.status_code(),
                    "message": c.status.message,
                    "latency_ms": c.status.latency_ms,
                    "last_check": c.last_check.to_rfc3339(),
                })
            })
            .collect();

        serde_json::json!({
            "status": self.status_code(),
            "health_checks": components,
        })
    }
}
