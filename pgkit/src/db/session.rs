// Sessions: one borrowed connection for a unit of work, with nested transaction scopes
//
// Depth 0 means no transaction. Entering depth 1 issues BEGIN, every deeper
// level a SAVEPOINT named after its depth. A Transaction handle that is dropped
// without commit/rollback schedules a rollback which the session issues before
// its next statement. A session dropped with an open transaction hands its
// connection back as broken so the pool closes it instead of reusing it.

use crate::db::connection::Connection;
use crate::db::pool::PooledConnection;
use crate::db::value::{Row, Value};
use crate::errors::DatabaseError;
use crate::query::QueryBuilder;
use futures::future::BoxFuture;
use std::ops::{Deref, DerefMut};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

fn savepoint_name(depth: u32) -> String {
    format!("pgkit_sp_{}", depth)
}

/// A unit of work bound to one pooled connection until closed or dropped
pub struct Session {
    id: Uuid,
    conn: Option<PooledConnection>,
    depth: u32,
    /// Shallowest depth whose scope was abandoned and still needs rolling back
    pending_rollback: Option<u32>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("open", &self.conn.is_some())
            .field("depth", &self.depth)
            .finish()
    }
}

impl Session {
    pub fn new(conn: PooledConnection) -> Self {
        let id = Uuid::new_v4();
        debug!(session_id = %id, "Session opened");
        Self {
            id,
            conn: Some(conn),
            depth: 0,
            pending_rollback: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Current transaction nesting depth, 0 outside any transaction
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    fn connection(&mut self) -> Result<&mut PooledConnection, DatabaseError> {
        self.conn.as_mut().ok_or(DatabaseError::SessionClosed)
    }

    fn schedule_rollback(&mut self, depth: u32) {
        self.pending_rollback = Some(self.pending_rollback.map_or(depth, |p| p.min(depth)));
    }

    /// Roll back every abandoned scope before the next statement runs
    async fn settle(&mut self) -> Result<(), DatabaseError> {
        let Some(target) = self.pending_rollback.take() else {
            return Ok(());
        };
        if target > self.depth {
            return Ok(());
        }

        let id = self.id;
        let conn = self.connection()?;
        let outcome = if target == 1 {
            conn.execute_script("ROLLBACK").await
        } else {
            let name = savepoint_name(target);
            conn.execute_script(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"
            ))
            .await
        };

        match outcome {
            Ok(()) => {
                debug!(session_id = %id, depth = target, "Rolled back abandoned transaction scope");
                self.depth = target - 1;
                Ok(())
            }
            Err(e) => {
                error!(session_id = %id, depth = target, error = %e, "Rollback of abandoned transaction scope failed");
                conn.mark_broken();
                self.depth = 0;
                Err(e)
            }
        }
    }

    #[instrument(skip(self, args), fields(session_id = %self.id))]
    pub async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DatabaseError> {
        self.settle().await?;
        self.connection()?.execute(sql, args).await
    }

    #[instrument(skip(self, args), fields(session_id = %self.id))]
    pub async fn fetch(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        self.settle().await?;
        self.connection()?.fetch(sql, args).await
    }

    #[instrument(skip(self, args), fields(session_id = %self.id))]
    pub async fn fetch_one(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Row>, DatabaseError> {
        self.settle().await?;
        self.connection()?.fetch_one(sql, args).await
    }

    /// First column of the first row; no row and SQL NULL both give `None`
    #[instrument(skip(self, args), fields(session_id = %self.id))]
    pub async fn fetch_value(
        &mut self,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Value>, DatabaseError> {
        self.settle().await?;
        self.connection()?.fetch_value(sql, args).await
    }

    #[instrument(skip(self, batches), fields(session_id = %self.id, batches = batches.len()))]
    pub async fn execute_many(
        &mut self,
        sql: &str,
        batches: &[Vec<Value>],
    ) -> Result<u64, DatabaseError> {
        self.settle().await?;
        self.connection()?.execute_many(sql, batches).await
    }

    /// Multi-statement text without parameters (DDL, migration bodies)
    #[instrument(skip(self, sql), fields(session_id = %self.id))]
    pub async fn execute_script(&mut self, sql: &str) -> Result<(), DatabaseError> {
        self.settle().await?;
        self.connection()?.execute_script(sql).await
    }

    /// Run several statements in order, returning each affected-row count.
    /// Stops at the first failure.
    pub async fn execute_batch(
        &mut self,
        statements: &[(String, Vec<Value>)],
    ) -> Result<Vec<u64>, DatabaseError> {
        let mut results = Vec::with_capacity(statements.len());
        for (index, (sql, args)) in statements.iter().enumerate() {
            match self.execute(sql, args).await {
                Ok(affected) => results.push(affected),
                Err(e) => {
                    warn!(session_id = %self.id, index, error = %e, "Batch statement failed");
                    return Err(e);
                }
            }
        }
        Ok(results)
    }

    /// Insert each row (ordered column/value pairs) into `table`. With
    /// `returning` the inserted rows are fetched back, otherwise the result is empty.
    pub async fn insert_batch(
        &mut self,
        table: &str,
        rows: &[Vec<(String, Value)>],
        returning: bool,
    ) -> Result<Vec<Row>, DatabaseError> {
        let mut inserted = Vec::new();
        for values in rows {
            let mut builder = QueryBuilder::new(table);
            if returning {
                builder = builder.returning(["*"]);
            }
            let (sql, args) = builder.build_insert(values)?;
            if returning {
                inserted.extend(self.fetch(&sql, &args).await?);
            } else {
                self.execute(&sql, &args).await?;
            }
        }
        Ok(inserted)
    }

    /// Open a transaction scope: BEGIN at depth 0, a savepoint when nested
    #[instrument(skip(self), fields(session_id = %self.id, depth = self.depth + 1))]
    pub async fn begin(&mut self) -> Result<Transaction<'_>, DatabaseError> {
        self.settle().await?;
        let depth = self.depth + 1;
        let sql = if depth == 1 {
            "BEGIN".to_string()
        } else {
            format!("SAVEPOINT {}", savepoint_name(depth))
        };
        self.connection()?.execute_script(&sql).await?;
        self.depth = depth;
        Ok(Transaction {
            session: self,
            depth,
            finished: false,
        })
    }

    /// Run `f` inside a transaction scope. `Ok` commits; `Err` rolls back and
    /// the body's error is returned even if the rollback itself fails.
    ///
    /// ```ignore
    /// session.transaction(|s| Box::pin(async move {
    ///     s.execute("UPDATE accounts SET balance = balance - $1 WHERE id = $2", &args![10, 1]).await?;
    ///     s.execute("UPDATE accounts SET balance = balance + $1 WHERE id = $2", &args![10, 2]).await?;
    ///     Ok::<_, DatabaseError>(())
    /// })).await?;
    /// ```
    pub async fn transaction<F, T, E>(&mut self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Session) -> BoxFuture<'c, Result<T, E>>,
        E: From<DatabaseError>,
    {
        let mut tx = self.begin().await?;
        let outcome = f(&mut *tx).await;
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed transaction body also failed");
                }
                Err(err)
            }
        }
    }

    /// Give the connection back to the pool. Any open transaction is rolled back first.
    /// Closing twice is a no-op.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn close(&mut self) -> Result<(), DatabaseError> {
        if self.conn.is_none() {
            return Ok(());
        }

        let mut result = self.settle().await;
        if result.is_ok() && self.depth > 0 {
            // Scopes leaked with mem::forget are still open on the server
            self.schedule_rollback(1);
            result = self.settle().await;
        }

        if let Some(mut conn) = self.conn.take() {
            if self.depth > 0 {
                conn.mark_broken();
            }
            drop(conn);
        }
        self.depth = 0;
        self.pending_rollback = None;
        debug!(session_id = %self.id, "Session closed");
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if self.depth > 0 || self.pending_rollback.is_some() {
                warn!(
                    session_id = %self.id,
                    depth = self.depth,
                    "Session dropped inside a transaction; discarding its connection"
                );
                conn.mark_broken();
            }
        }
    }
}

/// An open transaction scope. Derefs to the owning [`Session`] so statements
/// run through it; nested scopes come from calling `begin` on it.
#[must_use = "a transaction rolls back unless committed"]
pub struct Transaction<'s> {
    session: &'s mut Session,
    depth: u32,
    finished: bool,
}

impl Transaction<'_> {
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// COMMIT at depth 1, RELEASE SAVEPOINT when nested. A nested commit only
    /// folds its effects into the enclosing scope.
    pub async fn commit(mut self) -> Result<(), DatabaseError> {
        self.finished = true;
        let depth = self.depth;
        // Abandoned children are rolled back before their parent commits
        self.session.settle().await?;

        let sql = if depth == 1 {
            "COMMIT".to_string()
        } else {
            format!("RELEASE SAVEPOINT {}", savepoint_name(depth))
        };
        match self.session.connection()?.execute_script(&sql).await {
            Ok(()) => {
                self.session.depth = depth - 1;
                Ok(())
            }
            Err(e) => {
                if depth == 1 {
                    // A failed COMMIT ends the transaction on the server
                    self.session.depth = 0;
                } else {
                    self.session.schedule_rollback(depth);
                }
                Err(e)
            }
        }
    }

    /// ROLLBACK at depth 1, ROLLBACK TO SAVEPOINT when nested. Depth is restored
    /// to the enclosing scope either way.
    pub async fn rollback(mut self) -> Result<(), DatabaseError> {
        self.finished = true;
        let depth = self.depth;
        self.session.schedule_rollback(depth);
        self.session.settle().await
    }
}

impl Deref for Transaction<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(depth = self.depth, "Transaction dropped without commit; rollback scheduled");
            self.session.schedule_rollback(self.depth);
        }
    }
}
