use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apm_core::health::{HealthChecker, KvHealthCheck, StoreHealthCheck};
use apm_core::store::ClickHouseConnector;
use apm_core::{
    DataSourceRegistry, LockCoordinator, QueryExecutor, RedisLockCoordinator, Scheduler, Shutdown,
    SystemProvider, TimeProvider, WatermarkPromotionJob,
};
use tokio::signal;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::Filter;

use crate::config::Config;

pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    let clock: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());

    // Store endpoints
    let connector = Arc::new(ClickHouseConnector::new(&config.store));
    let registry = Arc::new(DataSourceRegistry::new(config.store.clone(), connector));
    let registered = registry.connect().await;
    info!(
        registered,
        configured = config.store.data_source_ids().len(),
        "data sources connected"
    );
    let executor = Arc::new(QueryExecutor::new(registry.clone()));

    let lock: Arc<dyn LockCoordinator> = Arc::new(RedisLockCoordinator::new(&config.kv)?);
    let shutdown = Shutdown::new();

    // Promotion job
    let scheduler = if config.job.enabled {
        let job = Arc::new(WatermarkPromotionJob::new(
            executor,
            lock.clone(),
            clock.clone(),
            config.job.clone(),
            config.store.tables.clone(),
        ));
        let scheduler = Scheduler::new(config.job.interval(), shutdown.clone());
        Some(tokio::spawn(async move { scheduler.run(job).await }))
    } else {
        info!("promotion job disabled");
        None
    };

    // Health probe
    let health = Arc::new(
        HealthChecker::new(clock.clone())
            .with_check(Arc::new(StoreHealthCheck::new(registry, clock)))
            .with_check(Arc::new(KvHealthCheck::new(lock))),
    );
    let routes = health_route(health).with(warp::trace::request());
    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let stop = shutdown.clone();
    let (bound, http_server) =
        warp::serve(routes).try_bind_with_graceful_shutdown(addr, async move { stop.requested().await })?;
    info!(addr = %bound, "health endpoint listening");
    let http_server = tokio::spawn(http_server);

    // Wait for shutdown
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => error!(error = %err, "Signal error"),
    }
    shutdown.request();

    let drained = shutdown
        .drain(Duration::from_secs(config.general.shutdown_timeout_secs))
        .await;
    if let Some(handle) = scheduler {
        if drained {
            handle.await?;
        } else {
            warn!("abandoning in-flight promotion job");
            handle.abort();
        }
    }
    http_server.await?;

    info!("shutdown complete");
    Ok(())
}

/// `GET /health`: runs every check and answers with the aggregate status
fn health_route(
    health: Arc<HealthChecker>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(move || {
            let health = health.clone();
            async move {
                health.run_checks().await;
                let status = StatusCode::from_u16(health.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&health.to_json()), status))
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_core::health::{HealthCheck, HealthStatus};
    use apm_core::MemoryLockCoordinator;

    struct Down;

    #[async_trait::async_trait]
    impl HealthCheck for Down {
        fn name(&self) -> &str {
            "store"
        }

        async fn check(&self) -> HealthStatus {
            HealthStatus::down("connection refused", 0.5)
        }
    }

    fn checker() -> HealthChecker {
        let clock: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        HealthChecker::new(clock).with_check(Arc::new(KvHealthCheck::new(Arc::new(MemoryLockCoordinator::new()))))
    }

    #[tokio::test]
    async fn test_health_up() {
        let route = health_route(Arc::new(checker()));
        let res = warp::test::request().method("GET").path("/health").reply(&route).await;

        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["status"], 200);
        assert_eq!(body["health_checks"][0]["name"], "kv");
    }

    #[tokio::test]
    async fn test_health_down_is_503() {
        let route = health_route(Arc::new(checker().with_check(Arc::new(Down))));
        let res = warp::test::request().method("GET").path("/health").reply(&route).await;

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["health_checks"][1]["status"], "DOWN");
        assert_eq!(body["health_checks"][1]["message"], "connection refused");
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let route = health_route(Arc::new(checker()));
        let res = warp::test::request().method("GET").path("/health/extra").reply(&route).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
