// Error handling for the database layer
// Every failure surfaced to callers is one distinguishable variant of DatabaseError

use thiserror::Error;

/// Errors returned by every pgkit operation
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Handshake or mid-query I/O failure. The connection involved is discarded.
    #[error("Database connection failed: {message}")]
    Connection {
        message: String,
        statement: Option<String>,
    },

    /// Malformed SQL, constraint violation or any other server-side rejection
    #[error("Query execution failed: {message} (statement: {statement})")]
    Query {
        message: String,
        statement: String,
        code: Option<String>,
    },

    /// A model field contract was violated before reaching the database
    #[error("Invalid value for field '{field}': {reason}")]
    Validation { field: String, reason: String },

    #[error("Connection pool exhausted: no connection available after {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Migration '{version}' has already been applied")]
    MigrationAlreadyApplied { version: String },
}

/// Fieldless discriminant of [`DatabaseError`] for branching and mapping upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Query,
    Validation,
    PoolExhausted,
    PoolClosed,
    SessionClosed,
    MigrationAlreadyApplied,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::Query => "QUERY_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::PoolClosed => "POOL_CLOSED",
            ErrorKind::SessionClosed => "SESSION_CLOSED",
            ErrorKind::MigrationAlreadyApplied => "MIGRATION_ALREADY_APPLIED",
        }
    }

    /// Suggested HTTP status for handlers that surface this error
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 422,
            ErrorKind::MigrationAlreadyApplied => 409,
            ErrorKind::PoolExhausted | ErrorKind::PoolClosed | ErrorKind::Connection => 503,
            ErrorKind::Query | ErrorKind::SessionClosed => 500,
        }
    }
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DatabaseError::Connection { .. } => ErrorKind::Connection,
            DatabaseError::Query { .. } => ErrorKind::Query,
            DatabaseError::Validation { .. } => ErrorKind::Validation,
            DatabaseError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            DatabaseError::PoolClosed => ErrorKind::PoolClosed,
            DatabaseError::SessionClosed => ErrorKind::SessionClosed,
            DatabaseError::MigrationAlreadyApplied { .. } => ErrorKind::MigrationAlreadyApplied,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        DatabaseError::Connection {
            message: message.into(),
            statement: None,
        }
    }

    pub fn query(statement: impl Into<String>, message: impl Into<String>) -> Self {
        DatabaseError::Query {
            message: message.into(),
            statement: statement.into(),
            code: None,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DatabaseError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True when the connection that produced this error can no longer be trusted
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, DatabaseError::Connection { .. })
    }

    /// SQLSTATE code reported by the server, if any
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            DatabaseError::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Classify a driver error raised while running `statement`
    pub fn from_sqlx(err: sqlx::Error, statement: &str) -> Self {
        match err {
            sqlx::Error::Database(db_err) => DatabaseError::Query {
                message: db_err.message().to_string(),
                statement: statement.to_string(),
                code: db_err.code().map(|c| c.into_owned()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DatabaseError::Connection {
                message: err.to_string(),
                statement: Some(statement.to_string()),
            },
            other => DatabaseError::Query {
                message: other.to_string(),
                statement: statement.to_string(),
                code: None,
            },
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(e) => DatabaseError::connection(e.to_string()),
            other => DatabaseError::from_sqlx(other, "<connect>"),
        }
    }
}

/// Unique-violation SQLSTATE
pub const UNIQUE_VIOLATION: &str = "23505";
