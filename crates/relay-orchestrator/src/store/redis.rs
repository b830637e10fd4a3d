//! Redis-backed shared store and distributed lock.
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so each operation clones it instead of locking.
//!
//! # Lock Algorithm
//!
//! `acquire` issues `SET name token NX PX ttl` with a fresh UUID token,
//! retrying up to `retry_count` times with `retry_delay + rand(0..=jitter)`
//! between attempts. `release` runs [`lua_scripts::RELEASE_LOCK`].

use super::{lua_scripts, DistributedLock, LockHandle, SharedStore};
use crate::errors::OrchestratorError;
use crate::observability::metrics;
use async_trait::async_trait;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

/// Retry policy for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct LockRetryPolicy {
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
}

impl LockRetryPolicy {
    fn delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.retry_delay + Duration::from_millis(extra)
    }
}

/// Shared store and distributed lock over a single Redis deployment.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    release_script: Script,
    lock_retry: LockRetryPolicy,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Store` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        lock_retry: LockRetryPolicy,
    ) -> Result<Self, OrchestratorError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may contain credentials
            error!(
                target: "ro.store.redis",
                error = %e,
                "Failed to open Redis client"
            );
            OrchestratorError::Store(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "ro.store.redis",
                    error = %e,
                    "Failed to connect to Redis"
                );
                OrchestratorError::Store(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            release_script: Script::new(lua_scripts::RELEASE_LOCK),
            lock_retry,
        })
    }

    async fn try_acquire(
        &self,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, OrchestratorError> {
        let mut conn = self.connection.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("acquire lock", name, &e))?;

        Ok(reply.is_some())
    }
}

fn store_error(operation: &str, key: &str, e: &redis::RedisError) -> OrchestratorError {
    warn!(
        target: "ro.store.redis",
        error = %e,
        key = %key,
        operation = operation,
        "Redis operation failed"
    );
    OrchestratorError::Store(format!("Failed to {operation} {key}: {e}"))
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.get(key)
            .await
            .map_err(|e| store_error("get", key, &e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.set(key, value)
            .await
            .map_err(|e| store_error("set", key, &e))
    }

    async fn del(&self, key: &str) -> Result<(), OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.del(key)
            .await
            .map_err(|e| store_error("del", key, &e))
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.hget(hash, field)
            .await
            .map_err(|e| store_error("hget", hash, &e))
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.hset(hash, field, value)
            .await
            .map_err(|e| store_error("hset", hash, &e))
    }

    async fn hdel(&self, hash: &str, field: &str) -> Result<(), OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.hdel(hash, field)
            .await
            .map_err(|e| store_error("hdel", hash, &e))
    }

    async fn hgetall(&self, hash: &str) -> Result<HashMap<String, String>, OrchestratorError> {
        let mut conn = self.connection.clone();
        conn.hgetall(hash)
            .await
            .map_err(|e| store_error("hgetall", hash, &e))
    }
}

#[async_trait]
impl DistributedLock for RedisStore {
    #[instrument(skip_all, fields(lock = %name))]
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockHandle, OrchestratorError> {
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let attempts = self.lock_retry.retry_count.max(1);

        for attempt in 1..=attempts {
            if self.try_acquire(name, &token, ttl).await? {
                metrics::record_lock_wait(started.elapsed());
                debug!(
                    target: "ro.store.redis",
                    lock = %name,
                    attempt = attempt,
                    "Lock acquired"
                );
                return Ok(LockHandle {
                    name: name.to_string(),
                    token,
                });
            }

            if attempt < attempts {
                tokio::time::sleep(self.lock_retry.delay()).await;
            }
        }

        warn!(
            target: "ro.store.redis",
            lock = %name,
            attempts = attempts,
            "Lock acquisition exhausted retries"
        );
        Err(OrchestratorError::Store(format!(
            "Failed to acquire lock {name} after {attempts} attempts"
        )))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), OrchestratorError> {
        let mut conn = self.connection.clone();

        let released: i64 = self
            .release_script
            .key(&handle.name)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("release lock", &handle.name, &e))?;

        if released == 0 {
            debug!(
                target: "ro.store.redis",
                lock = %handle.name,
                "Lock already expired before release"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_stays_within_jitter() {
        let policy = LockRetryPolicy {
            retry_count: 50,
            retry_delay: Duration::from_millis(200),
            retry_jitter: Duration::from_millis(200),
        };

        for _ in 0..100 {
            let delay = policy.delay();
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_retry_delay_without_jitter() {
        let policy = LockRetryPolicy {
            retry_count: 1,
            retry_delay: Duration::from_millis(10),
            retry_jitter: Duration::ZERO,
        };

        assert_eq!(policy.delay(), Duration::from_millis(10));
    }
}
