// Query construction

pub mod builder;
pub mod fragment;

pub use builder::{Direction, JoinKind, QueryBuilder};
pub use fragment::validate_identifier;
