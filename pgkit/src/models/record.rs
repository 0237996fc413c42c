// Records: one row of a model with per-field validation and change tracking

use crate::db::session::Session;
use crate::db::value::{FromValue, Row, Value};
use crate::errors::DatabaseError;
use crate::models::definition::ModelDef;
use crate::models::field::FieldDefault;
use crate::query::QueryBuilder;
use std::sync::Arc;
use tracing::{debug, instrument};

/// One row of a model. Slots follow the model's field order; `None` means
/// "never set", which is distinct from an explicit SQL NULL.
#[derive(Debug, Clone)]
pub struct Record {
    model: Arc<ModelDef>,
    values: Vec<Option<Value>>,
    dirty: Vec<bool>,
    persisted: bool,
}

impl Record {
    pub(crate) fn new(model: Arc<ModelDef>) -> Self {
        let values: Vec<Option<Value>> = model
            .fields()
            .iter()
            .map(|field| match &field.default {
                FieldDefault::Value(value) => field.field_type.coerce(value.clone()).ok(),
                _ => None,
            })
            .collect();
        let dirty = values.iter().map(Option::is_some).collect();
        Self {
            model,
            values,
            dirty,
            persisted: false,
        }
    }

    pub(crate) fn from_row(model: Arc<ModelDef>, row: Row) -> Result<Self, DatabaseError> {
        let len = model.fields().len();
        let mut record = Self {
            model,
            values: vec![None; len],
            dirty: vec![false; len],
            persisted: true,
        };
        record.load(row)?;
        Ok(record)
    }

    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    /// Replace slot values with the columns of `row`. Unknown columns are ignored.
    fn load(&mut self, row: Row) -> Result<(), DatabaseError> {
        for (column, value) in row.into_values() {
            if let Some(slot) = self.model.slot(&column) {
                let field = &self.model.fields()[slot];
                let value = field.field_type.coerce(value).map_err(|reason| {
                    DatabaseError::query(
                        self.model.table(),
                        format!("column '{}' returned an unexpected value: {}", column, reason),
                    )
                })?;
                self.values[slot] = Some(value);
                self.dirty[slot] = false;
            }
        }
        Ok(())
    }

    /// Assign a field, validating its type, nullability and length
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), DatabaseError> {
        let slot = self.model.slot(name).ok_or_else(|| {
            DatabaseError::validation(
                name,
                format!("unknown field on model '{}'", self.model.table()),
            )
        })?;
        let field = &self.model.fields()[slot];

        let value = value.into();
        if value.is_null() && !field.nullable {
            return Err(DatabaseError::validation(name, "value cannot be null"));
        }
        let value = field
            .field_type
            .coerce(value)
            .map_err(|reason| DatabaseError::validation(name, reason))?;

        if field.primary_key && self.persisted && self.values[slot].as_ref() != Some(&value) {
            return Err(DatabaseError::validation(
                name,
                "primary key cannot change once the record is persisted",
            ));
        }

        if self.values[slot].as_ref() != Some(&value) {
            self.values[slot] = Some(value);
            self.dirty[slot] = true;
        }
        Ok(())
    }

    /// Chaining form of [`Record::set`]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self, DatabaseError> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Current value, `None` if the field is unknown or was never set
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.model
            .slot(name)
            .and_then(|slot| self.values[slot].as_ref())
    }

    pub fn try_get<T: FromValue>(&self, name: &str) -> Result<T, DatabaseError> {
        static NULL: Value = Value::Null;
        let value = self.get(name).unwrap_or(&NULL);
        T::from_value(value).ok_or_else(|| {
            DatabaseError::validation(
                name,
                format!(
                    "holds {} which cannot be converted to {}",
                    value.type_name(),
                    std::any::type_name::<T>()
                ),
            )
        })
    }

    /// Primary key value, once set or generated
    pub fn id(&self) -> Option<&Value> {
        self.values[self.model.primary_key_slot()]
            .as_ref()
            .filter(|v| !v.is_null())
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }

    /// Fields changed since the record was loaded or last saved
    pub fn dirty_fields(&self) -> Vec<&str> {
        self.model
            .fields()
            .iter()
            .zip(&self.dirty)
            .filter(|(_, dirty)| **dirty)
            .map(|(field, _)| field.name.as_str())
            .collect()
    }

    /// Set fields as a JSON object; unset fields are omitted
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .model
            .fields()
            .iter()
            .zip(&self.values)
            .filter_map(|(field, value)| value.as_ref().map(|v| (field.name.clone(), v.to_json())))
            .collect();
        serde_json::Value::Object(map)
    }

    fn returning_all(&self) -> QueryBuilder {
        QueryBuilder::new(self.model.table()).returning(self.model.column_names())
    }

    /// INSERT the fields that were set. Server-generated keys and server
    /// defaults are read back through RETURNING.
    #[instrument(skip(self, session), fields(table = %self.model.table()))]
    pub async fn insert(&mut self, session: &mut Session) -> Result<(), DatabaseError> {
        if self.persisted {
            return Err(DatabaseError::validation(
                self.model.primary_key().name.clone(),
                "record is already persisted; use update",
            ));
        }
        for (field, value) in self.model.fields().iter().zip(&self.values) {
            if value.is_none() && field.is_required() {
                return Err(DatabaseError::validation(
                    field.name.clone(),
                    "required field is not set",
                ));
            }
        }

        let set: Vec<(String, Value)> = self
            .model
            .fields()
            .iter()
            .zip(&self.values)
            .filter_map(|(field, value)| value.clone().map(|v| (field.name.clone(), v)))
            .collect();

        let (sql, args) = if set.is_empty() {
            (
                format!(
                    "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                    self.model.table(),
                    self.model.column_names().join(", ")
                ),
                Vec::new(),
            )
        } else {
            self.returning_all().build_insert(&set)?
        };

        let row = session.fetch_one(&sql, &args).await?.ok_or_else(|| {
            DatabaseError::query(sql.as_str(), "INSERT ... RETURNING produced no row")
        })?;
        self.load(row)?;
        self.dirty.iter_mut().for_each(|d| *d = false);
        self.persisted = true;
        debug!(table = %self.model.table(), "Record inserted");
        Ok(())
    }

    /// UPDATE the changed fields, keyed by primary key. Returns false when
    /// nothing changed (no round trip) or the row no longer exists.
    #[instrument(skip(self, session), fields(table = %self.model.table()))]
    pub async fn update(&mut self, session: &mut Session) -> Result<bool, DatabaseError> {
        let pk = self.model.primary_key();
        let id = self.id().cloned().ok_or_else(|| {
            DatabaseError::validation(pk.name.clone(), "cannot update a record without a primary key")
        })?;

        let pk_slot = self.model.primary_key_slot();
        let changed: Vec<(String, Value)> = self
            .model
            .fields()
            .iter()
            .enumerate()
            .filter(|(slot, _)| self.dirty[*slot] && *slot != pk_slot)
            .filter_map(|(slot, field)| {
                self.values[slot]
                    .clone()
                    .map(|value| (field.name.clone(), value))
            })
            .collect();
        if changed.is_empty() {
            return Ok(false);
        }

        let (sql, args) = self
            .returning_all()
            .where_eq(&pk.name, id)
            .build_update(&changed)?;
        match session.fetch_one(&sql, &args).await? {
            Some(row) => {
                self.load(row)?;
                self.dirty.iter_mut().for_each(|d| *d = false);
                self.persisted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// DELETE by primary key; true iff exactly one row was removed
    #[instrument(skip(self, session), fields(table = %self.model.table()))]
    pub async fn delete(&mut self, session: &mut Session) -> Result<bool, DatabaseError> {
        let pk = self.model.primary_key();
        let id = self.id().cloned().ok_or_else(|| {
            DatabaseError::validation(pk.name.clone(), "cannot delete a record without a primary key")
        })?;
        let (sql, args) = QueryBuilder::new(self.model.table())
            .where_eq(&pk.name, id)
            .build_delete()?;
        let deleted = session.execute(&sql, &args).await? == 1;
        if deleted {
            self.persisted = false;
        }
        Ok(deleted)
    }

    /// Insert when new, update otherwise
    pub async fn save(&mut self, session: &mut Session) -> Result<(), DatabaseError> {
        if self.persisted {
            self.update(session).await.map(|_| ())
        } else {
            self.insert(session).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::db::pool::{Pool, PoolOptions};
    use crate::models::field::FieldDef;
    use crate::test_support::{row, Reply, ScriptedManager};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn users() -> Arc<ModelDef> {
        ModelDef::builder("users")
            .field(FieldDef::primary_key("id"))
            .field(FieldDef::string("email", 20))
            .field(FieldDef::text("nickname").nullable())
            .field(FieldDef::boolean("active").default_value(true))
            .field(FieldDef::timestamp("created_at").server_default("now()"))
            .build()
            .unwrap()
    }

    async fn session(manager: &ScriptedManager) -> (Pool, Session) {
        let pool = Pool::connect(manager.clone().into_dyn(), PoolOptions::default())
            .await
            .unwrap();
        let session = Session::new(pool.acquire().await.unwrap());
        (pool, session)
    }

    fn stored_row() -> Row {
        row([
            ("id", Value::Int(1)),
            ("email", Value::from("ada@example.com")),
            ("nickname", Value::Null),
            ("active", Value::Bool(true)),
            (
                "created_at",
                Value::Timestamp(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            ),
        ])
    }

    #[test]
    fn test_set_validates_type_null_and_length() {
        let mut record = users().new_record();

        let err = record.set("email", 5).unwrap_err();
        assert!(matches!(err, DatabaseError::Validation { ref field, .. } if field == "email"));

        let err = record.set("email", Value::Null).unwrap_err();
        assert!(err.to_string().contains("cannot be null"));

        let err = record.set("email", "a-very-long-address@example.com").unwrap_err();
        assert!(err.to_string().contains("VARCHAR(20)"));

        let err = record.set("unknown", 1).unwrap_err();
        assert!(matches!(err, DatabaseError::Validation { ref field, .. } if field == "unknown"));

        record.set("nickname", Option::<String>::None).unwrap();
        assert_eq!(record.get("nickname"), Some(&Value::Null));
    }

    #[test]
    fn test_value_defaults_apply_to_new_records() {
        let record = users().new_record();
        assert_eq!(record.get("active"), Some(&Value::Bool(true)));
        assert_eq!(record.get("created_at"), None);
        assert_eq!(record.dirty_fields(), vec!["active"]);
    }

    #[tokio::test]
    async fn test_insert_sends_set_fields_and_reads_back_defaults() {
        let manager =
            ScriptedManager::new().with_responder(|_, _| Ok(Reply::Rows(vec![stored_row()])));
        let (_pool, mut session) = session(&manager).await;

        let mut record = users().new_record().with("email", "ada@example.com").unwrap();
        record.insert(&mut session).await.unwrap();

        let calls = manager.calls();
        assert_eq!(
            calls[0].0,
            "INSERT INTO users (email, active) VALUES ($1, $2) \
             RETURNING id, email, nickname, active, created_at"
        );
        assert_eq!(calls[0].1, args!["ada@example.com", true]);

        assert!(record.is_persisted());
        assert!(!record.is_dirty());
        assert_eq!(record.id(), Some(&Value::Int(1)));
        assert!(matches!(record.get("created_at"), Some(Value::Timestamp(_))));
        assert_eq!(record.get("nickname"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_insert_missing_required_field_fails_before_round_trip() {
        let manager = ScriptedManager::new();
        let (_pool, mut session) = session(&manager).await;

        let mut record = users().new_record();
        let err = record.insert(&mut session).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Validation { ref field, .. } if field == "email"));
        assert!(manager.statements().is_empty());
    }

    #[tokio::test]
    async fn test_insert_with_nothing_set_uses_default_values() {
        let model = ModelDef::builder("events")
            .field(FieldDef::uuid_primary_key("id"))
            .field(FieldDef::timestamp("at").server_default("now()"))
            .build()
            .unwrap();
        let manager = ScriptedManager::new().with_responder(|_, _| {
            Ok(Reply::Rows(vec![row([
                ("id", Value::Uuid(uuid::Uuid::new_v4())),
                ("at", Value::Timestamp(Utc::now())),
            ])]))
        });
        let (_pool, mut session) = session(&manager).await;

        let mut record = model.new_record();
        record.insert(&mut session).await.unwrap();
        assert_eq!(
            manager.statements()[0],
            "INSERT INTO events DEFAULT VALUES RETURNING id, at"
        );
        assert!(record.id().is_some());
    }

    #[tokio::test]
    async fn test_update_sends_only_changed_fields() {
        let manager =
            ScriptedManager::new().with_responder(|_, _| Ok(Reply::Rows(vec![stored_row()])));
        let (_pool, mut session) = session(&manager).await;
        let mut record = users().record_from_row(stored_row()).unwrap();

        // Nothing changed: no round trip
        assert!(!record.update(&mut session).await.unwrap());
        assert!(manager.statements().is_empty());

        record.set("nickname", "ada").unwrap();
        record.set("active", false).unwrap();
        assert!(record.update(&mut session).await.unwrap());

        let calls = manager.calls();
        assert_eq!(
            calls[0].0,
            "UPDATE users SET nickname = $1, active = $2 WHERE id = $3 \
             RETURNING id, email, nickname, active, created_at"
        );
        assert_eq!(calls[0].1, args!["ada", false, 1]);
        assert!(!record.is_dirty());
    }

    #[test]
    fn test_primary_key_is_immutable_once_persisted() {
        let mut record = users().record_from_row(stored_row()).unwrap();
        assert!(record.set("id", 1).is_ok());
        assert!(record.set("id", 2).is_err());
    }

    #[tokio::test]
    async fn test_delete_reports_exactly_one_row() {
        let manager = ScriptedManager::new().with_responder(|_, args| {
            if args == [Value::Int(1)] {
                Ok(Reply::Affected(1))
            } else {
                Ok(Reply::Affected(0))
            }
        });
        let (_pool, mut session) = session(&manager).await;

        let mut record = users().record_from_row(stored_row()).unwrap();
        assert!(record.delete(&mut session).await.unwrap());
        assert!(!record.is_persisted());
        assert_eq!(manager.statements()[0], "DELETE FROM users WHERE id = $1");

        let mut other = users().new_record();
        other.set("id", 99).unwrap();
        assert!(!other.delete(&mut session).await.unwrap());

        let mut unsaved = users().new_record();
        assert!(unsaved.delete(&mut session).await.is_err());
    }

    #[tokio::test]
    async fn test_save_dispatches_on_persisted_state() {
        let manager =
            ScriptedManager::new().with_responder(|_, _| Ok(Reply::Rows(vec![stored_row()])));
        let (_pool, mut session) = session(&manager).await;

        let mut record = users().new_record().with("email", "ada@example.com").unwrap();
        record.save(&mut session).await.unwrap();
        record.set("email", "ada@example.org").unwrap();
        record.save(&mut session).await.unwrap();

        let statements = manager.statements();
        assert!(statements[0].starts_with("INSERT INTO users"));
        assert!(statements[1].starts_with("UPDATE users SET email = $1"));
    }

    #[test]
    fn test_to_json_omits_unset_fields() {
        let record = users()
            .new_record()
            .with("email", "ada@example.com")
            .unwrap();
        assert_eq!(
            record.to_json(),
            json!({"email": "ada@example.com", "active": true})
        );
    }
}
