// Database client: the process-wide entry point wrapping the pool

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, ConnectionManager, PgConnector};
use crate::db::pool::{Pool, PoolInfo, PoolOptions, PooledConnection};
use crate::db::session::Session;
use crate::db::value::{Row, Value};
use crate::errors::DatabaseError;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Database client. Build it once at startup and pass clones where needed;
/// every clone shares the same pool.
#[derive(Clone, Debug)]
pub struct DatabaseClient {
    pool: Pool,
}

impl DatabaseClient {
    /// Connect to PostgreSQL and open the pool's initial connections
    #[instrument(skip(config), fields(target = %config.redacted_url()))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        config
            .validate()
            .map_err(|reason| DatabaseError::validation("database", reason))?;

        info!(
            min_size = config.min_size,
            max_size = config.max_size,
            "Creating database connection pool"
        );
        let manager: Arc<dyn ConnectionManager> = Arc::new(PgConnector::new(config));
        Self::with_manager(manager, PoolOptions::from(config)).await
    }

    /// Build a client over any connection manager
    pub async fn with_manager(
        manager: Arc<dyn ConnectionManager>,
        options: PoolOptions,
    ) -> Result<Self, DatabaseError> {
        let pool = Pool::connect(manager, options).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Borrow a raw connection; it returns to the pool when dropped
    pub async fn acquire(&self) -> Result<PooledConnection, DatabaseError> {
        self.pool.acquire().await
    }

    /// Open a session holding one connection until it is closed
    pub async fn session(&self) -> Result<Session, DatabaseError> {
        Ok(Session::new(self.pool.acquire().await?))
    }

    #[instrument(skip(self, args))]
    pub async fn execute(&self, sql: &str, args: &[Value]) -> Result<u64, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        conn.execute(sql, args).await
    }

    #[instrument(skip(self, args))]
    pub async fn fetch(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        conn.fetch(sql, args).await
    }

    #[instrument(skip(self, args))]
    pub async fn fetch_one(&self, sql: &str, args: &[Value]) -> Result<Option<Row>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        conn.fetch_one(sql, args).await
    }

    #[instrument(skip(self, args))]
    pub async fn fetch_value(
        &self,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Value>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        conn.fetch_value(sql, args).await
    }

    #[instrument(skip(self, batches), fields(batches = batches.len()))]
    pub async fn execute_many(
        &self,
        sql: &str,
        batches: &[Vec<Value>],
    ) -> Result<u64, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        conn.execute_many(sql, batches).await
    }

    /// Run `f` in a transaction on a fresh session which is closed afterwards
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, Result<T, E>>,
        E: From<DatabaseError>,
    {
        let mut session = self.session().await?;
        let outcome = session.transaction(f).await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close transaction session");
        }
        outcome
    }

    /// Round-trip ping on a pooled connection. Never fails; errors are logged.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> bool {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Database health check could not acquire a connection");
                return false;
            }
        };
        match conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                false
            }
        }
    }

    pub fn pool_info(&self) -> PoolInfo {
        self.pool.info()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
