// Physical connections and the connector that opens them
// The pool only sees the Connection/ConnectionManager traits; PostgreSQL is one implementation

use crate::config::DatabaseConfig;
use crate::db::value::{Row, Value};
use crate::errors::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{
    PgArgumentBuffer, PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode, PgTypeInfo,
};
use sqlx::query::Query;
use sqlx::{Column, ConnectOptions, Connection as _, Postgres, Row as _, TypeInfo};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::instrument;
use uuid::Uuid;

/// A live database connection, exclusively owned by one borrower at a time
#[async_trait]
pub trait Connection: Send {
    /// Run a parameterized statement and return the affected row count
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DatabaseError>;

    /// Run a parameterized query and return every row
    async fn fetch(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>, DatabaseError>;

    /// Run one or more statements without parameters (transaction control, DDL scripts)
    async fn execute_script(&mut self, sql: &str) -> Result<(), DatabaseError>;

    /// First row of the result, if any
    async fn fetch_one(&mut self, sql: &str, args: &[Value]) -> Result<Option<Row>, DatabaseError> {
        Ok(self.fetch(sql, args).await?.into_iter().next())
    }

    /// First column of the first row. Both "no row" and SQL NULL yield `None`.
    async fn fetch_value(&mut self, sql: &str, args: &[Value]) -> Result<Option<Value>, DatabaseError> {
        let row = self.fetch_one(sql, args).await?;
        Ok(row
            .and_then(|row| row.get_index(0).cloned())
            .filter(|value| !value.is_null()))
    }

    /// Run the same statement once per argument list, returning the total affected rows
    async fn execute_many(&mut self, sql: &str, batches: &[Vec<Value>]) -> Result<u64, DatabaseError> {
        let mut affected = 0;
        for args in batches {
            affected += self.execute(sql, args).await?;
        }
        Ok(affected)
    }

    /// Round-trip liveness check
    async fn ping(&mut self) -> Result<(), DatabaseError>;

    /// A broken connection is discarded by the pool instead of being reused
    fn is_broken(&self) -> bool;

    fn mark_broken(&mut self);

    /// Graceful shutdown of the physical connection
    async fn close(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Opens new physical connections for the pool (handshake included)
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError>;

    /// Human-readable target for logs; must not contain credentials
    fn describe(&self) -> String;
}

/// Connector for PostgreSQL built from [`DatabaseConfig`]
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    command_timeout: Duration,
    target: String,
}

impl PgConnector {
    pub fn new(config: &DatabaseConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password)
            .statement_cache_capacity(100);

        if config.server_hostname.is_some() {
            options = options.ssl_mode(PgSslMode::Require);
        }

        if let Some(settings) = &config.server_settings {
            options = options.options(settings.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        // Statement logging is done by our own spans
        options = options.disable_statement_logging();

        Self {
            options,
            command_timeout: config.command_timeout(),
            target: config.redacted_url(),
        }
    }
}

#[async_trait]
impl ConnectionManager for PgConnector {
    #[instrument(skip(self), fields(target = %self.target))]
    async fn connect(&self) -> Result<Box<dyn Connection>, DatabaseError> {
        let conn = tokio::time::timeout(self.command_timeout, self.options.connect())
            .await
            .map_err(|_| {
                DatabaseError::connection(format!(
                    "handshake with {} timed out after {:?}",
                    self.target, self.command_timeout
                ))
            })?
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to open database connection");
                DatabaseError::connection(format!("failed to connect to {}: {}", self.target, e))
            })?;

        tracing::debug!("Database connection opened");
        Ok(Box::new(PgConnectionHandle {
            conn,
            command_timeout: self.command_timeout,
            broken: false,
        }))
    }

    fn describe(&self) -> String {
        self.target.clone()
    }
}

/// A PostgreSQL connection with a per-command timeout
pub struct PgConnectionHandle {
    conn: PgConnection,
    command_timeout: Duration,
    broken: bool,
}

/// NULL bound with an unspecified parameter type so the server infers it
/// from context (a typed NULL would fail against columns of other types)
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_args<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg.clone() {
            Value::Null => query.bind(UntypedNull),
            Value::Bool(v) => query.bind(v),
            Value::SmallInt(v) => query.bind(v),
            Value::Int(v) => query.bind(v),
            Value::BigInt(v) => query.bind(v),
            Value::Double(v) => query.bind(v),
            Value::Text(v) => query.bind(v),
            Value::Uuid(v) => query.bind(v),
            Value::Timestamp(v) => query.bind(v),
            Value::Date(v) => query.bind(v),
            Value::Json(v) => query.bind(v),
            Value::Bytes(v) => query.bind(v),
        };
    }
    query
}

/// Server types decoded as `Value::Text`
const TEXT_TYPES: &[&str] = &["TEXT", "VARCHAR", "BPCHAR", "CHAR", "NAME", "CITEXT", "UNKNOWN"];

/// Column types with no `Value` counterpart. Callers cast them in SQL.
fn unsupported_column(column: &str, type_name: &str, sql: &str) -> DatabaseError {
    DatabaseError::query(
        sql,
        format!(
            "column '{}' has unsupported type {}; cast it in the query (e.g. ::float8 or ::text)",
            column, type_name
        ),
    )
}

fn decode_column(row: &PgRow, index: usize, sql: &str) -> Result<Value, DatabaseError> {
    let column = row.column(index);
    let type_name = column.type_info().name().to_ascii_uppercase();
    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| v.map(Value::Bool)),
        "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| v.map(Value::SmallInt)),
        "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| v.map(Value::Int)),
        "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| v.map(Value::BigInt)),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map(|v| v.map(|v| Value::Double(f64::from(v)))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| v.map(Value::Double)),
        "UUID" => row.try_get::<Option<Uuid>, _>(index).map(|v| v.map(Value::Uuid)),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| v.map(Value::Timestamp)),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map(|v| Value::Timestamp(v.and_utc()))),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index).map(|v| v.map(Value::Date)),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map(|v| v.map(Value::Json)),
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index).map(|v| v.map(Value::Bytes)),
        text if TEXT_TYPES.contains(&text) => {
            row.try_get::<Option<String>, _>(index).map(|v| v.map(Value::Text))
        }
        other => return Err(unsupported_column(column.name(), other, sql)),
    };
    decoded
        .map(|value| value.unwrap_or(Value::Null))
        .map_err(|e| DatabaseError::from_sqlx(e, sql))
}

fn decode_row(row: &PgRow, sql: &str) -> Result<Row, DatabaseError> {
    let mut columns = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, sql)?;
        columns.push((column.name().to_string(), value));
    }
    Ok(Row::new(columns))
}

#[async_trait]
impl Connection for PgConnectionHandle {
    async fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64, DatabaseError> {
        let query = bind_args(sqlx::query(sql), args);
        let fut = query.execute(&mut self.conn);
        let outcome = timed(self.command_timeout, fut).await;
        let result = flatten_outcome(outcome, sql, self.command_timeout, &mut self.broken)?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, sql: &str, args: &[Value]) -> Result<Vec<Row>, DatabaseError> {
        let query = bind_args(sqlx::query(sql), args);
        let fut = query.fetch_all(&mut self.conn);
        let outcome = timed(self.command_timeout, fut).await;
        let rows = flatten_outcome(outcome, sql, self.command_timeout, &mut self.broken)?;
        rows.iter().map(|row| decode_row(row, sql)).collect()
    }

    async fn execute_script(&mut self, sql: &str) -> Result<(), DatabaseError> {
        let fut = sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(sql));
        let outcome = timed(self.command_timeout, fut).await;
        flatten_outcome(outcome, sql, self.command_timeout, &mut self.broken)?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DatabaseError> {
        let timeout = self.command_timeout;
        let conn = &mut self.conn;
        let outcome = timed(timeout, conn.ping()).await;
        flatten_outcome(outcome, "<ping>", timeout, &mut self.broken)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    async fn close(self: Box<Self>) -> Result<(), DatabaseError> {
        let handle = *self;
        handle
            .conn
            .close()
            .await
            .map_err(|e| DatabaseError::from_sqlx(e, "<close>"))
    }
}

/// Runs one round trip under the command timeout and records its latency
async fn timed<T, F>(
    timeout: Duration,
    fut: F,
) -> Result<Result<T, sqlx::Error>, tokio::time::error::Elapsed>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, fut).await;
    metrics::histogram!("db_query_duration_seconds").record(started.elapsed().as_secs_f64());
    outcome
}

/// Unwraps a timed round trip, classifying the failure and flagging the
/// connection as broken when it can no longer be trusted
fn flatten_outcome<T>(
    outcome: Result<Result<T, sqlx::Error>, tokio::time::error::Elapsed>,
    sql: &str,
    timeout: Duration,
    broken: &mut bool,
) -> Result<T, DatabaseError> {
    match outcome {
        Err(_) => {
            *broken = true;
            Err(DatabaseError::Connection {
                message: format!("command timed out after {:?}", timeout),
                statement: Some(sql.to_string()),
            })
        }
        Ok(Err(e)) => {
            let err = DatabaseError::from_sqlx(e, sql);
            if err.is_connection_failure() {
                *broken = true;
            }
            Err(err)
        }
        Ok(Ok(value)) => Ok(value),
    }
}
