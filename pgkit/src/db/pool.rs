// Bounded connection pool
// A semaphore caps concurrent borrows at max_size; the idle queue and live count
// are only touched inside one short critical section

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, ConnectionManager};
use crate::errors::DatabaseError;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, instrument, warn};

/// Sizing and timeout settings for a [`Pool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub min_size: usize,
    pub max_size: usize,
    /// `None` waits for a free connection indefinitely
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            acquire_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl From<&DatabaseConfig> for PoolOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            min_size: config.min_size as usize,
            max_size: config.max_size as usize,
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

/// Point-in-time pool counters for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    /// Live connections, idle plus borrowed
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub closed: bool,
}

struct PoolState {
    idle: VecDeque<Box<dyn Connection>>,
    live: usize,
    closed: bool,
}

struct PoolInner {
    manager: Arc<dyn ConnectionManager>,
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_gauges(state: &PoolState) {
        gauge!("db_pool_connections").set(state.live as f64);
        gauge!("db_pool_idle_connections").set(state.idle.len() as f64);
    }

    /// Hands a connection back: healthy ones rejoin the idle queue, broken ones
    /// (or any returned after close) are dropped and stop counting as live
    fn return_connection(&self, conn: Box<dyn Connection>) {
        let discarded = {
            let mut state = self.state();
            if state.closed || conn.is_broken() {
                state.live = state.live.saturating_sub(1);
                Self::publish_gauges(&state);
                Some(conn)
            } else {
                state.idle.push_back(conn);
                Self::publish_gauges(&state);
                None
            }
        };

        if let Some(conn) = discarded {
            counter!("db_pool_discarded_total").increment(1);
            tracing::debug!("Discarding connection instead of returning it to the pool");
            drop(conn);
        }
    }
}

/// Shared handle to a bounded set of live connections. Cloning is cheap.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("target", &self.inner.manager.describe())
            .field("info", &self.info())
            .finish()
    }
}

impl Pool {
    /// Create a pool and eagerly open `min_size` connections
    ///
    /// # Errors
    /// `Validation` for inconsistent sizes, `Connection` if any initial
    /// handshake fails (connections opened so far are closed again)
    #[instrument(skip(manager), fields(target = %manager.describe()))]
    pub async fn connect(
        manager: Arc<dyn ConnectionManager>,
        options: PoolOptions,
    ) -> Result<Self, DatabaseError> {
        if options.max_size == 0 {
            return Err(DatabaseError::validation(
                "max_size",
                "must be greater than 0",
            ));
        }
        if options.min_size > options.max_size {
            return Err(DatabaseError::validation(
                "min_size",
                format!(
                    "{} exceeds max_size {}",
                    options.min_size, options.max_size
                ),
            ));
        }

        let mut opened: Vec<Box<dyn Connection>> = Vec::with_capacity(options.min_size);
        for _ in 0..options.min_size {
            match manager.connect().await {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to open initial pool connections");
                    for conn in opened {
                        let _ = conn.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let live = opened.len();
        let state = PoolState {
            idle: opened.into_iter().collect(),
            live,
            closed: false,
        };
        PoolInner::publish_gauges(&state);

        info!(
            min_size = options.min_size,
            max_size = options.max_size,
            "Connection pool initialized"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                options,
                semaphore: Arc::new(Semaphore::new(options.max_size)),
                state: Mutex::new(state),
            }),
        })
    }

    /// Borrow a connection, waiting until one is idle or a new one may be opened
    ///
    /// Cancelling the returned future while it waits claims nothing.
    ///
    /// # Errors
    /// - `PoolClosed` if the pool is (or becomes) closed
    /// - `PoolExhausted` if the acquire timeout elapses
    /// - `Connection` if a new connection was needed and its handshake failed
    pub async fn acquire(&self) -> Result<PooledConnection, DatabaseError> {
        if self.inner.state().closed {
            return Err(DatabaseError::PoolClosed);
        }

        let started = Instant::now();
        let permit_future = self.inner.semaphore.clone().acquire_owned();
        let permit = match self.inner.options.acquire_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, permit_future).await {
                Ok(permit) => permit,
                Err(_) => {
                    counter!("db_pool_acquire_timeouts_total").increment(1);
                    warn!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        max_size = self.inner.options.max_size,
                        "Timed out waiting for a pooled connection"
                    );
                    return Err(DatabaseError::PoolExhausted {
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            },
            None => permit_future.await,
        }
        .map_err(|_| DatabaseError::PoolClosed)?;

        counter!("db_pool_acquire_total").increment(1);

        loop {
            let candidate = {
                let mut state = self.inner.state();
                if state.closed {
                    return Err(DatabaseError::PoolClosed);
                }
                let candidate = state.idle.pop_front();
                if let Some(conn) = &candidate {
                    if conn.is_broken() {
                        state.live = state.live.saturating_sub(1);
                    }
                }
                PoolInner::publish_gauges(&state);
                candidate
            };

            match candidate {
                Some(conn) if conn.is_broken() => {
                    counter!("db_pool_discarded_total").increment(1);
                    continue;
                }
                Some(conn) => return Ok(PooledConnection::new(conn, self.inner.clone(), permit)),
                None => break,
            }
        }

        // No idle connection, and the permit guarantees room for one more
        let conn = self.inner.manager.connect().await?;
        let closed_meanwhile = {
            let mut state = self.inner.state();
            if !state.closed {
                state.live += 1;
                PoolInner::publish_gauges(&state);
            }
            state.closed
        };

        if closed_meanwhile {
            let _ = conn.close().await;
            return Err(DatabaseError::PoolClosed);
        }

        Ok(PooledConnection::new(conn, self.inner.clone(), permit))
    }

    /// Return a borrowed connection. Dropping the guard has the same effect.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Close every idle connection and refuse further borrows.
    /// Connections still borrowed are closed when they come back.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let drained: Vec<Box<dyn Connection>> = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            PoolInner::publish_gauges(&state);
            drained
        };

        self.inner.semaphore.close();

        for conn in drained {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Error while closing pooled connection");
            }
        }
        info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn info(&self) -> PoolInfo {
        let state = self.inner.state();
        PoolInfo {
            size: state.live,
            idle: state.idle.len(),
            in_use: state.live - state.idle.len(),
            min_size: self.inner.options.min_size,
            max_size: self.inner.options.max_size,
            closed: state.closed,
        }
    }
}

/// A connection borrowed from the pool; returned to it on drop
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            _permit: permit,
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
        // The permit is released after this, once the connection is back in the queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedManager;

    fn options(min: usize, max: usize, timeout_ms: Option<u64>) -> PoolOptions {
        PoolOptions {
            min_size: min,
            max_size: max,
            acquire_timeout: timeout_ms.map(Duration::from_millis),
        }
    }

    #[tokio::test]
    async fn test_opens_min_size_eagerly() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(3, 5, None))
            .await
            .unwrap();

        assert_eq!(manager.opened(), 3);
        let info = pool.info();
        assert_eq!(info.size, 3);
        assert_eq!(info.idle, 3);
        assert_eq!(info.in_use, 0);
    }

    #[tokio::test]
    async fn test_rejects_min_above_max() {
        let manager = ScriptedManager::new();
        let err = Pool::connect(manager.into_dyn(), options(4, 2, None))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Validation { ref field, .. } if field == "min_size"));
    }

    #[tokio::test]
    async fn test_grows_on_demand_up_to_max() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(0, 2, Some(50)))
            .await
            .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.info().size, 2);
        assert_eq!(manager.opened(), 2);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DatabaseError::PoolExhausted { .. }));
        assert_eq!(pool.info().size, 2);

        pool.release(a);
        drop(b);
        assert_eq!(pool.info().idle, 2);
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(0, 1, None))
            .await
            .unwrap();

        let conn = pool.acquire().await.unwrap();
        drop(conn);
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(manager.opened(), 1);
    }

    #[tokio::test]
    async fn test_waiter_is_served_by_next_release() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(1, 1, Some(2_000)))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(manager.opened(), 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded_and_replaced() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(1, 1, None))
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);

        let info = pool.info();
        assert_eq!(info.size, 0);
        assert_eq!(info.idle, 0);

        let conn = pool.acquire().await.unwrap();
        assert!(!conn.is_broken());
        assert_eq!(manager.opened(), 2);
        assert_eq!(pool.info().size, 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_does_not_count_as_live() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(0, 2, None))
            .await
            .unwrap();

        manager.set_fail_connect(true);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DatabaseError::Connection { .. }));
        assert_eq!(pool.info().size, 0);

        // The permit was returned, so both slots are still usable
        manager.set_fail_connect(false);
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.info().size, 2);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails_fast() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.clone().into_dyn(), options(2, 2, None))
            .await
            .unwrap();

        pool.close().await;
        assert_eq!(manager.closed(), 2);
        assert!(pool.is_closed());

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DatabaseError::PoolClosed));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_with_pool_closed() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.into_dyn(), options(1, 1, None))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DatabaseError::PoolClosed)));

        // A connection returned after close is dropped, not queued
        drop(held);
        assert_eq!(pool.info().size, 0);
        assert_eq!(pool.info().idle, 0);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_claims_nothing() {
        let manager = ScriptedManager::new();
        let pool = Pool::connect(manager.into_dyn(), options(1, 1, None))
            .await
            .unwrap();

        let held = pool.acquire().await.unwrap();
        let attempt = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(attempt.is_err());

        drop(held);
        let info = pool.info();
        assert_eq!(info.idle, 1);
        assert_eq!(info.in_use, 0);
        let _conn = pool.acquire().await.unwrap();
    }
}
