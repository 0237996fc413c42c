// Database layer: connections, pooling, sessions and transactions

pub mod client;
pub mod connection;
pub mod introspection;
pub mod pool;
pub mod session;
pub mod session_manager;
pub mod value;

pub use client::DatabaseClient;
pub use connection::{Connection, ConnectionManager, PgConnector};
pub use introspection::{ColumnInfo, IndexInfo};
pub use pool::{Pool, PoolInfo, PoolOptions, PooledConnection};
pub use session::{Session, Transaction};
pub use session_manager::{SessionManager, SharedSession};
pub use value::{FromValue, Row, Value};
