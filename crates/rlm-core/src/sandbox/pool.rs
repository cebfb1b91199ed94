//! Bounded executor pool with scoped leases.
//!
//! A `tokio::sync::Semaphore` caps concurrent leases at the pool size; the
//! idle list is the only shared mutable state and is touched only while its
//! mutex is held. An [`ExecutorLease`] hands its executor back on `Drop`, so
//! capacity is returned on every exit path: early return, `?`, cancellation
//! and unwinding alike.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::metrics::METRICS;

use super::error::{PoolError, PoolResult};
use super::executor::{Executor, ExecutorFactory};
use super::security::SecurityConfig;

/// Pool sizing and the security settings handed to the factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently leased (and therefore running) executors.
    pub size: usize,
    /// Default wait for [`ExecutorPool::acquire_default`] (milliseconds).
    pub acquire_timeout_ms: u64,
    /// Forwarded opaquely to [`ExecutorFactory::create`].
    pub security: SecurityConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            acquire_timeout_ms: 30_000,
            security: SecurityConfig::default(),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub leased: usize,
}

struct PooledExecutor {
    executor: Box<dyn Executor>,
    dirty: bool,
}

struct PoolShared {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<PooledExecutor>>,
}

impl PoolShared {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<PooledExecutor>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed-size pool of sandbox executors.
pub struct ExecutorPool {
    factory: Arc<dyn ExecutorFactory>,
    config: PoolConfig,
    shared: Arc<PoolShared>,
}

impl ExecutorPool {
    /// Create a pool. Executors are constructed lazily on first acquire, or
    /// eagerly via [`ExecutorPool::warm_up`].
    pub fn new(factory: Arc<dyn ExecutorFactory>, config: PoolConfig) -> PoolResult<Self> {
        if config.size == 0 {
            return Err(PoolError::ExecutorUnavailable(
                "pool size must be at least 1".to_string(),
            ));
        }
        let shared = Arc::new(PoolShared {
            permits: Arc::new(Semaphore::new(config.size)),
            idle: Mutex::new(Vec::with_capacity(config.size)),
        });
        Ok(Self {
            factory,
            config,
            shared,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.config.size
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.lock_idle().len();
        let leased = self.config.size - self.shared.permits.available_permits();
        PoolStats {
            size: self.config.size,
            idle,
            leased,
        }
    }

    /// Acquire with the configured default timeout.
    pub async fn acquire_default(&self) -> PoolResult<ExecutorLease> {
        self.acquire(Duration::from_millis(self.config.acquire_timeout_ms))
            .await
    }

    /// Lease an executor, waiting at most `timeout` for capacity.
    ///
    /// Dead idle handles are discarded and replaced here, at the expense of
    /// the caller that found them. Handles used by a previous lease are
    /// reset first; a failed reset also leads to a replacement.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<ExecutorLease> {
        let timeout_ms = timeout.as_millis() as u64;
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.shared.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                debug!(timeout_ms, "executor pool exhausted");
                return Err(PoolError::Exhausted { timeout_ms });
            }
        };

        // The guard is a temporary; the lock is released before any await.
        let candidate = self.shared.lock_idle().pop();

        let executor = match candidate {
            Some(pooled) if !pooled.executor.is_alive() => {
                debug!("discarding dead executor");
                METRICS.inc_executors_recycled();
                self.construct().await?
            }
            Some(mut pooled) if pooled.dirty => match pooled.executor.reset().await {
                Ok(()) if pooled.executor.is_alive() => pooled.executor,
                Ok(()) => {
                    METRICS.inc_executors_recycled();
                    self.construct().await?
                }
                Err(e) => {
                    warn!(error = %e, "executor reset failed; replacing");
                    METRICS.inc_executors_recycled();
                    self.construct().await?
                }
            },
            Some(pooled) => pooled.executor,
            None => self.construct().await?,
        };

        Ok(ExecutorLease {
            executor: Some(executor),
            used: false,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Construct executors until every free slot holds one.
    ///
    /// Returns the number of leases that could be taken immediately.
    pub async fn warm_up(&self) -> PoolResult<usize> {
        let mut leases = Vec::with_capacity(self.config.size);
        while leases.len() < self.config.size {
            match self.acquire(Duration::ZERO).await {
                Ok(lease) => leases.push(lease),
                Err(PoolError::Exhausted { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(leases.len())
    }

    async fn construct(&self) -> PoolResult<Box<dyn Executor>> {
        self.factory
            .create(&self.config.security)
            .await
            .map_err(|e| PoolError::ExecutorUnavailable(e.to_string()))
    }
}

/// Exclusive use of one executor. Returned to the pool on drop.
pub struct ExecutorLease {
    executor: Option<Box<dyn Executor>>,
    used: bool,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl ExecutorLease {
    /// Return the executor now. Equivalent to dropping the lease.
    pub fn release(self) {}
}

impl Deref for ExecutorLease {
    type Target = dyn Executor;

    fn deref(&self) -> &Self::Target {
        match self.executor.as_deref() {
            Some(executor) => executor,
            None => unreachable!("executor taken before lease drop"),
        }
    }
}

impl DerefMut for ExecutorLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.used = true;
        match self.executor.as_deref_mut() {
            Some(executor) => executor,
            None => unreachable!("executor taken before lease drop"),
        }
    }
}

impl Drop for ExecutorLease {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.take() {
            self.shared.lock_idle().push(PooledExecutor {
                executor,
                dirty: self.used,
            });
        }
        // `_permit` is dropped after this body, so the handle is back in the
        // idle list before a waiter can be woken.
    }
}
