// Model definitions: table name, ordered fields and the name -> slot dispatch table

use crate::db::session::Session;
use crate::db::value::{Row, Value};
use crate::errors::DatabaseError;
use crate::models::field::{FieldDef, FieldDefault};
use crate::models::record::Record;
use crate::query::{validate_identifier, QueryBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// Schema of one table, built once and shared by every [`Record`] of the model
#[derive(Debug)]
pub struct ModelDef {
    table: String,
    fields: Vec<FieldDef>,
    slots: HashMap<String, usize>,
    primary_key: usize,
}

pub struct ModelDefBuilder {
    table: String,
    fields: Vec<FieldDef>,
}

impl ModelDefBuilder {
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Validate identifiers, uniqueness of names and the single primary key
    pub fn build(self) -> Result<Arc<ModelDef>, DatabaseError> {
        validate_identifier(&self.table)?;
        if self.fields.is_empty() {
            return Err(DatabaseError::validation(
                self.table,
                "a model needs at least one field",
            ));
        }

        let mut slots = HashMap::with_capacity(self.fields.len());
        for (index, field) in self.fields.iter().enumerate() {
            validate_identifier(&field.name)?;
            if field.name.contains('.') {
                return Err(DatabaseError::validation(
                    field.name.clone(),
                    "field names cannot be schema-qualified",
                ));
            }
            if slots.insert(field.name.clone(), index).is_some() {
                return Err(DatabaseError::validation(
                    field.name.clone(),
                    "field declared twice",
                ));
            }
            if let Err(reason) = default_type_check(field) {
                return Err(DatabaseError::validation(field.name.clone(), reason));
            }
        }

        let keys: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.primary_key)
            .map(|(i, _)| i)
            .collect();
        let primary_key = match keys.as_slice() {
            [single] => *single,
            [] => {
                return Err(DatabaseError::validation(
                    self.table,
                    "model has no primary key",
                ))
            }
            _ => {
                return Err(DatabaseError::validation(
                    self.table,
                    "model declares more than one primary key",
                ))
            }
        };

        Ok(Arc::new(ModelDef {
            table: self.table,
            fields: self.fields,
            slots,
            primary_key,
        }))
    }
}

fn default_type_check(field: &FieldDef) -> Result<(), String> {
    if let FieldDefault::Value(value) = &field.default {
        if value.is_null() && !field.nullable {
            return Err("default is NULL but the field is not nullable".to_string());
        }
        field.field_type.coerce(value.clone())?;
    }
    Ok(())
}

impl ModelDef {
    pub fn builder(table: impl Into<String>) -> ModelDefBuilder {
        ModelDefBuilder {
            table: table.into(),
            fields: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.slot(name).map(|i| &self.fields[i])
    }

    pub(crate) fn slot(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn primary_key(&self) -> &FieldDef {
        &self.fields[self.primary_key]
    }

    pub(crate) fn primary_key_slot(&self) -> usize {
        self.primary_key
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// A fresh, unsaved record with value defaults applied
    pub fn new_record(self: &Arc<Self>) -> Record {
        Record::new(self.clone())
    }

    /// Record for a row read from this model's table
    pub fn record_from_row(self: &Arc<Self>, row: Row) -> Result<Record, DatabaseError> {
        Record::from_row(self.clone(), row)
    }

    /// CREATE TABLE plus one CREATE INDEX per indexed field
    pub fn create_table_sql(&self) -> String {
        let columns: Vec<String> = self.fields.iter().map(FieldDef::column_sql).collect();
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            self.table,
            columns.join(", ")
        );
        let table_slug = self.table.replace('.', "_");
        for field in self.fields.iter().filter(|f| f.indexed && !f.primary_key) {
            sql.push_str(&format!(
                " CREATE INDEX IF NOT EXISTS idx_{}_{} ON {} ({});",
                table_slug, field.name, self.table, field.name
            ));
        }
        sql
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", self.table)
    }

    #[instrument(skip(self, session), fields(table = %self.table))]
    pub async fn create_table(&self, session: &mut Session) -> Result<(), DatabaseError> {
        session.execute_script(&self.create_table_sql()).await
    }

    #[instrument(skip(self, session), fields(table = %self.table))]
    pub async fn drop_table(&self, session: &mut Session) -> Result<(), DatabaseError> {
        session.execute_script(&self.drop_table_sql()).await
    }

    fn select(&self) -> QueryBuilder {
        QueryBuilder::new(self.table.as_str()).select(self.column_names())
    }

    #[instrument(skip(self, session, id), fields(table = %self.table))]
    pub async fn get_by_id(
        self: &Arc<Self>,
        session: &mut Session,
        id: impl Into<Value> + Send,
    ) -> Result<Option<Record>, DatabaseError> {
        let id = self
            .primary_key()
            .field_type
            .coerce(id.into())
            .map_err(|reason| DatabaseError::validation(self.primary_key().name.clone(), reason))?;
        let (sql, args) = self
            .select()
            .where_eq(&self.primary_key().name, id)
            .build()?;
        match session.fetch_one(&sql, &args).await? {
            Some(row) => Ok(Some(self.record_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Every row, ordered by primary key
    #[instrument(skip(self, session), fields(table = %self.table))]
    pub async fn get_all(self: &Arc<Self>, session: &mut Session) -> Result<Vec<Record>, DatabaseError> {
        let (sql, args) = self.select().order_by(&self.primary_key().name).build()?;
        let rows = session.fetch(&sql, &args).await?;
        rows.into_iter().map(|row| self.record_from_row(row)).collect()
    }

    /// Rows matching an optional predicate written with `$1..$k` placeholders
    #[instrument(skip(self, session, args), fields(table = %self.table))]
    pub async fn count(
        &self,
        session: &mut Session,
        predicate: Option<&str>,
        args: &[Value],
    ) -> Result<i64, DatabaseError> {
        let (sql, args) = self.filtered(predicate, args).build_count()?;
        let value = session.fetch_value(&sql, &args).await?;
        Ok(value.and_then(|v| v.as_i64()).unwrap_or(0))
    }

    #[instrument(skip(self, session, args), fields(table = %self.table))]
    pub async fn exists(
        &self,
        session: &mut Session,
        predicate: Option<&str>,
        args: &[Value],
    ) -> Result<bool, DatabaseError> {
        let (inner, args) = self.filtered(predicate, args).select(["1"]).build()?;
        let sql = format!("SELECT EXISTS({})", inner);
        let value = session.fetch_value(&sql, &args).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn filtered(&self, predicate: Option<&str>, args: &[Value]) -> QueryBuilder {
        let builder = QueryBuilder::new(self.table.as_str());
        match predicate {
            Some(predicate) => builder.and_where(predicate, args.to_vec()),
            None if !args.is_empty() => builder.and_where("", args.to_vec()),
            None => builder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::db::pool::{Pool, PoolOptions};
    use crate::models::field::FieldType;
    use crate::test_support::{row, Reply, ScriptedManager};

    fn users() -> Arc<ModelDef> {
        ModelDef::builder("users")
            .field(FieldDef::primary_key("id"))
            .field(FieldDef::string("email", 255).unique().indexed())
            .field(FieldDef::text("name"))
            .field(FieldDef::boolean("active").default_value(true))
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

    #[test]
    fn test_requires_exactly_one_primary_key() {
        let err = ModelDef::builder("t")
            .field(FieldDef::text("name"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no primary key"));

        let err = ModelDef::builder("t")
            .field(FieldDef::primary_key("a"))
            .field(FieldDef::uuid_primary_key("b"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn test_rejects_bad_names_and_duplicates() {
        assert!(ModelDef::builder("users;--")
            .field(FieldDef::primary_key("id"))
            .build()
            .is_err());
        assert!(ModelDef::builder("users")
            .field(FieldDef::primary_key("id"))
            .field(FieldDef::text("id"))
            .build()
            .is_err());
        assert!(ModelDef::builder("users")
            .field(FieldDef::primary_key("id"))
            .field(FieldDef::new("bad name", FieldType::Text))
            .build()
            .is_err());
    }

    #[test]
    fn test_rejects_default_of_wrong_type() {
        let err = ModelDef::builder("t")
            .field(FieldDef::primary_key("id"))
            .field(FieldDef::boolean("flag").default_value("yes"))
            .build()
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Validation { ref field, .. } if field == "flag"));
    }

    #[test]
    fn test_create_and_drop_table_sql() {
        let model = users();
        assert_eq!(
            model.create_table_sql(),
            "CREATE TABLE IF NOT EXISTS users (id SERIAL PRIMARY KEY, \
             email VARCHAR(255) NOT NULL UNIQUE, name TEXT NOT NULL, \
             active BOOLEAN NOT NULL DEFAULT TRUE); \
             CREATE INDEX IF NOT EXISTS idx_users_email ON users (email);"
        );
        assert_eq!(model.drop_table_sql(), "DROP TABLE IF EXISTS users;");
    }

    #[tokio::test]
    async fn test_get_by_id_selects_declared_columns() {
        let manager = ScriptedManager::new().with_responder(|_, _| {
            Ok(Reply::Rows(vec![row([
                ("id", Value::Int(4)),
                ("email", Value::from("ada@example.com")),
                ("name", Value::from("Ada")),
                ("active", Value::Bool(true)),
            ])]))
        });
        let (_pool, mut session) = session(&manager).await;
        let model = users();

        let record = model.get_by_id(&mut session, 4i64).await.unwrap().unwrap();
        assert_eq!(record.get("email"), Some(&Value::from("ada@example.com")));
        assert!(record.is_persisted());
        assert!(!record.is_dirty());

        let calls = manager.calls();
        assert_eq!(
            calls[0].0,
            "SELECT id, email, name, active FROM users WHERE id = $1"
        );
        assert_eq!(calls[0].1, args![4]);
    }

    #[tokio::test]
    async fn test_get_all_orders_by_primary_key() {
        let manager = ScriptedManager::new().with_responder(|_, _| Ok(Reply::Rows(vec![])));
        let (_pool, mut session) = session(&manager).await;

        let records = users().get_all(&mut session).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(
            manager.statements()[0],
            "SELECT id, email, name, active FROM users ORDER BY id"
        );
    }

    #[tokio::test]
    async fn test_count_and_exists() {
        let manager = ScriptedManager::new().with_responder(|sql, _| {
            if sql.starts_with("SELECT EXISTS") {
                Ok(Reply::Rows(vec![row([("exists", Value::Bool(true))])]))
            } else {
                Ok(Reply::Rows(vec![row([("count", Value::BigInt(12))])]))
            }
        });
        let (_pool, mut session) = session(&manager).await;
        let model = users();

        assert_eq!(model.count(&mut session, None, &[]).await.unwrap(), 12);
        assert!(model
            .exists(&mut session, Some("email = $1"), &args!["ada@example.com"])
            .await
            .unwrap());

        let statements = manager.statements();
        assert_eq!(statements[0], "SELECT COUNT(*) FROM users");
        assert_eq!(
            statements[1],
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)"
        );
    }

    #[tokio::test]
    async fn test_predicate_placeholder_mismatch_fails_before_round_trip() {
        let manager = ScriptedManager::new();
        let (_pool, mut session) = session(&manager).await;

        let err = users()
            .count(&mut session, Some("active = $1 AND name = $2"), &args![true])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Query { .. }));
        assert!(manager.statements().is_empty());
    }
}
