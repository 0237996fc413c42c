// Lightweight record mapping: models bound to tables, CRUD through a Session

pub mod definition;
pub mod field;
pub mod record;

pub use definition::{ModelDef, ModelDefBuilder};
pub use field::{FieldDef, FieldDefault, FieldType};
pub use record::Record;

use crate::db::session::Session;
use crate::db::value::Value;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use std::sync::Arc;

/// Bridges a plain Rust struct to a [`ModelDef`]
///
/// Implementors describe their table once (typically in a `OnceLock`) and
/// convert to and from [`Record`]; the CRUD helpers come for free.
#[async_trait]
pub trait Model: Sized + Send + Sync {
    fn definition() -> Arc<ModelDef>;

    fn to_record(&self) -> Result<Record, DatabaseError>;

    fn from_record(record: &Record) -> Result<Self, DatabaseError>;

    /// Insert and return the stored row, server defaults included
    async fn create(&self, session: &mut Session) -> Result<Self, DatabaseError> {
        let mut record = self.to_record()?;
        record.insert(session).await?;
        Self::from_record(&record)
    }

    async fn find(session: &mut Session, id: Value) -> Result<Option<Self>, DatabaseError> {
        let model = Self::definition();
        match model.get_by_id(session, id).await? {
            Some(record) => Ok(Some(Self::from_record(&record)?)),
            None => Ok(None),
        }
    }

    async fn all(session: &mut Session) -> Result<Vec<Self>, DatabaseError> {
        let model = Self::definition();
        model
            .get_all(session)
            .await?
            .iter()
            .map(Self::from_record)
            .collect()
    }
}
