// Catalog queries over information_schema and pg_catalog

use crate::args;
use crate::db::session::Session;
use crate::db::value::Row;
use crate::errors::DatabaseError;
use serde::Serialize;

/// One column as reported by `information_schema.columns`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
}

/// Split `schema.table` into its parts, defaulting the schema to `public`
fn qualified(table: &str) -> (String, String) {
    match table.split_once('.') {
        Some((schema, name)) => (schema.to_string(), name.to_string()),
        None => ("public".to_string(), table.to_string()),
    }
}

pub async fn table_exists(session: &mut Session, table: &str) -> Result<bool, DatabaseError> {
    let (schema, name) = qualified(table);
    let value = session
        .fetch_value(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
            &args![schema, name],
        )
        .await?;
    Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
}

/// Columns of `table` in ordinal order; empty if the table does not exist
pub async fn table_columns(
    session: &mut Session,
    table: &str,
) -> Result<Vec<ColumnInfo>, DatabaseError> {
    let (schema, name) = qualified(table);
    let rows = session
        .fetch(
            "SELECT column_name::text AS column_name, data_type::text AS data_type, \
             is_nullable::text AS is_nullable, column_default::text AS column_default \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position",
            &args![schema, name],
        )
        .await?;
    rows.iter().map(column_from_row).collect()
}

fn column_from_row(row: &Row) -> Result<ColumnInfo, DatabaseError> {
    Ok(ColumnInfo {
        name: row.try_get("column_name")?,
        data_type: row.try_get("data_type")?,
        nullable: row.try_get::<String>("is_nullable")? == "YES",
        default: row.try_get("column_default")?,
    })
}

pub async fn table_indexes(
    session: &mut Session,
    table: &str,
) -> Result<Vec<IndexInfo>, DatabaseError> {
    let (schema, name) = qualified(table);
    let rows = session
        .fetch(
            "SELECT indexname::text AS indexname, indexdef FROM pg_indexes \
             WHERE schemaname = $1 AND tablename = $2 ORDER BY indexname",
            &args![schema, name],
        )
        .await?;
    rows.iter()
        .map(|row| {
            Ok(IndexInfo {
                name: row.try_get("indexname")?,
                definition: row.try_get("indexdef")?,
            })
        })
        .collect()
}

/// Server-side connections to the current database
pub async fn connection_count(session: &mut Session) -> Result<i64, DatabaseError> {
    let value = session
        .fetch_value(
            "SELECT count(*) FROM pg_stat_activity WHERE datname = current_database()",
            &[],
        )
        .await?;
    Ok(value.and_then(|v| v.as_i64()).unwrap_or(0))
}

pub async fn current_database(session: &mut Session) -> Result<String, DatabaseError> {
    let value = session.fetch_value("SELECT current_database()", &[]).await?;
    value
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| DatabaseError::query("SELECT current_database()", "no database name returned"))
}
