//! Cluster-wide mutual exclusion for the promotion job
//!
//! A lock is a key created only if absent, carrying a TTL. There is no
//! renewal and no explicit release: the key simply expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{redis, Config, Pool, PoolError, Runtime};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::KvConfig;

/// Errors talking to the lock backend
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lock backend timed out")]
    Timeout,

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Conditional set-with-TTL on a shared key-value store
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Create `key` with `value` unless it already exists.
    ///
    /// Returns `false` when someone else holds the key; that is not an error.
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError>;

    async fn ping(&self) -> Result<(), LockError>;
}

/// Lock backed by Redis `SET key value NX EX ttl`
#[derive(Clone)]
pub struct RedisLockCoordinator {
    pool: Pool,
}

impl RedisLockCoordinator {
    /// Build the pool; no connection is made until first use
    pub fn new(config: &KvConfig) -> Result<Self, LockError> {
        let pool = Config::from_url(config.url())
            .builder()
            .map_err(|e| LockError::Connection(e.to_string()))?
            .max_size(config.pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, LockError> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => LockError::Timeout,
            other => LockError::Connection(other.to_string()),
        })
    }
}

#[async_trait]
impl LockCoordinator for RedisLockCoordinator {
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn ping(&self) -> Result<(), LockError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// In-process lock with TTL expiry, for single-instance runs
#[derive(Default)]
pub struct MemoryLockCoordinator {
    locks: Mutex<HashMap<String, HeldLock>>,
}

struct HeldLock {
    value: String,
    expires_at: Instant,
}

impl MemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder's value, if the key is held and not expired
    pub fn holder(&self, key: &str) -> Option<String> {
        self.locks
            .lock()
            .get(key)
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.value.clone())
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockCoordinator {
    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock();
        let now = Instant::now();

        if let Some(held) = locks.get(key) {
            if held.expires_at > now {
                debug!(key = %key, holder = %held.value, "lock held");
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            HeldLock {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn ping(&self) -> Result<(), LockError> {
        Ok(())
    }
}
