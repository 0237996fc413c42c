// PostgreSQL access layer: pooled connections, sessions with nested
// transactions, a parameterized query builder, table-bound models and
// versioned migrations

pub mod config;
pub mod db;
pub mod errors;
pub mod migrations;
pub mod models;
pub mod query;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{DatabaseConfig, Settings};
pub use db::{
    DatabaseClient, FromValue, Pool, PoolInfo, PoolOptions, Row, Session, SessionManager,
    Transaction, Value,
};
pub use errors::{DatabaseError, ErrorKind};
pub use migrations::{Migration, MigrationManager, MigrationStatus};
pub use models::{FieldDef, FieldType, Model, ModelDef, Record};
pub use query::QueryBuilder;
