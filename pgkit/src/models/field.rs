// Field definitions: semantic column types, nullability, keys and defaults

use crate::db::value::Value;

/// Semantic column type of a model field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    SmallInt,
    Integer,
    BigInt,
    /// Auto-incrementing INTEGER generated by the server
    Serial,
    BigSerial,
    Double,
    /// VARCHAR with a maximum length in characters
    Varchar(u32),
    Text,
    Boolean,
    Timestamp,
    TimestampTz,
    Date,
    Uuid,
    Json,
    Jsonb,
    Bytea,
}

impl FieldType {
    pub fn sql_type(&self) -> String {
        match self {
            FieldType::SmallInt => "SMALLINT".to_string(),
            FieldType::Integer => "INTEGER".to_string(),
            FieldType::BigInt => "BIGINT".to_string(),
            FieldType::Serial => "SERIAL".to_string(),
            FieldType::BigSerial => "BIGSERIAL".to_string(),
            FieldType::Double => "DOUBLE PRECISION".to_string(),
            FieldType::Varchar(n) => format!("VARCHAR({})", n),
            FieldType::Text => "TEXT".to_string(),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Timestamp => "TIMESTAMP".to_string(),
            FieldType::TimestampTz => "TIMESTAMPTZ".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::Uuid => "UUID".to_string(),
            FieldType::Json => "JSON".to_string(),
            FieldType::Jsonb => "JSONB".to_string(),
            FieldType::Bytea => "BYTEA".to_string(),
        }
    }

    /// Serial columns get their value from a sequence on insert
    pub fn is_server_generated(&self) -> bool {
        matches!(self, FieldType::Serial | FieldType::BigSerial)
    }

    /// Convert `value` to the exact variant this column stores, widening or
    /// narrowing integers when the value fits. `Null` passes through; the
    /// nullability check belongs to the field.
    pub fn coerce(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(value);
        }
        let mismatch = |value: &Value| {
            format!(
                "expected {} but got {}",
                self.sql_type(),
                value.type_name()
            )
        };

        match self {
            FieldType::SmallInt => match value.as_i64() {
                Some(v) => i16::try_from(v)
                    .map(Value::SmallInt)
                    .map_err(|_| format!("{} is out of range for SMALLINT", v)),
                None => Err(mismatch(&value)),
            },
            FieldType::Integer | FieldType::Serial => match value.as_i64() {
                Some(v) => i32::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| format!("{} is out of range for INTEGER", v)),
                None => Err(mismatch(&value)),
            },
            FieldType::BigInt | FieldType::BigSerial => match value.as_i64() {
                Some(v) => Ok(Value::BigInt(v)),
                None => Err(mismatch(&value)),
            },
            FieldType::Double => match value {
                Value::Double(_) => Ok(value),
                ref other => match other.as_i64() {
                    Some(v) => Ok(Value::Double(v as f64)),
                    None => Err(mismatch(other)),
                },
            },
            FieldType::Varchar(max) => match value {
                Value::Text(ref s) => {
                    let len = s.chars().count();
                    if len > *max as usize {
                        Err(format!("length {} exceeds VARCHAR({})", len, max))
                    } else {
                        Ok(value)
                    }
                }
                ref other => Err(mismatch(other)),
            },
            FieldType::Text => match value {
                Value::Text(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
            FieldType::Boolean => match value {
                Value::Bool(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
            FieldType::Timestamp | FieldType::TimestampTz => match value {
                Value::Timestamp(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
            FieldType::Date => match value {
                Value::Date(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
            FieldType::Uuid => match value {
                Value::Uuid(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
            FieldType::Json | FieldType::Jsonb => match value {
                Value::Json(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
            FieldType::Bytea => match value {
                Value::Bytes(_) => Ok(value),
                ref other => Err(mismatch(other)),
            },
        }
    }
}

/// Value a field takes when the caller never sets it
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    None,
    /// Applied to new records on construction
    Value(Value),
    /// SQL expression evaluated by the server (`DEFAULT <expr>` in the table DDL)
    Server(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub indexed: bool,
    pub default: FieldDefault,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            primary_key: false,
            unique: false,
            indexed: false,
            default: FieldDefault::None,
        }
    }

    /// SERIAL primary key
    pub fn primary_key(name: impl Into<String>) -> Self {
        Self {
            primary_key: true,
            ..Self::new(name, FieldType::Serial)
        }
    }

    /// UUID primary key generated by the server
    pub fn uuid_primary_key(name: impl Into<String>) -> Self {
        Self {
            primary_key: true,
            default: FieldDefault::Server("gen_random_uuid()".to_string()),
            ..Self::new(name, FieldType::Uuid)
        }
    }

    pub fn string(name: impl Into<String>, max_len: u32) -> Self {
        Self::new(name, FieldType::Varchar(max_len))
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn big_integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::BigInt)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn double(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Double)
    }

    /// TIMESTAMPTZ
    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::TimestampTz)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Date)
    }

    /// JSONB
    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Jsonb)
    }

    pub fn uuid(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Uuid)
    }

    pub fn bytes(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Bytea)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = FieldDefault::Value(value.into());
        self
    }

    /// Trusted SQL expression, e.g. `now()`
    pub fn server_default(mut self, expression: impl Into<String>) -> Self {
        self.default = FieldDefault::Server(expression.into());
        self
    }

    /// Insert fails unless the caller sets this field
    pub fn is_required(&self) -> bool {
        !self.nullable
            && !self.field_type.is_server_generated()
            && matches!(self.default, FieldDefault::None)
    }

    /// Column definition for CREATE TABLE
    pub fn column_sql(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.field_type.sql_type());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            sql.push_str(" UNIQUE");
        }
        match &self.default {
            FieldDefault::Server(expression) => {
                sql.push_str(" DEFAULT ");
                sql.push_str(expression);
            }
            FieldDefault::Value(value) => {
                if let Some(literal) = sql_literal(value) {
                    sql.push_str(" DEFAULT ");
                    sql.push_str(&literal);
                }
            }
            FieldDefault::None => {}
        }
        sql
    }
}

/// Literal rendering for DDL defaults only; statements always bind values
fn sql_literal(value: &Value) -> Option<String> {
    let quoted = |s: &str| format!("'{}'", s.replace('\'', "''"));
    match value {
        Value::Null => Some("NULL".to_string()),
        Value::Bool(v) => Some(if *v { "TRUE" } else { "FALSE" }.to_string()),
        Value::SmallInt(v) => Some(v.to_string()),
        Value::Int(v) => Some(v.to_string()),
        Value::BigInt(v) => Some(v.to_string()),
        Value::Double(v) if v.is_finite() => Some(v.to_string()),
        Value::Double(_) => None,
        Value::Text(v) => Some(quoted(v)),
        Value::Uuid(v) => Some(quoted(&v.to_string())),
        Value::Timestamp(v) => Some(quoted(&v.to_rfc3339())),
        Value::Date(v) => Some(quoted(&v.to_string())),
        Value::Json(v) => Some(quoted(&v.to_string())),
        Value::Bytes(_) => None,
    }
}
