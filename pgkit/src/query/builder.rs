// Fluent builder for parameterized statements
//
// Caller values only ever travel in the argument list. Condition fragments are
// written with local placeholders ($1..$k for their own k arguments) and are
// renumbered into one global sequence when the statement is rendered.

use crate::db::value::Value;
use crate::errors::DatabaseError;
use crate::query::fragment::{check_placeholders, renumber, validate_identifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

impl JoinKind {
    fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug)]
struct Condition {
    sql: String,
    args: Vec<Value>,
    /// Generated by a typed helper, so it never needs parentheses
    atomic: bool,
}

/// Builder for SELECT, INSERT, UPDATE, DELETE and COUNT statements on one table
///
/// Identifier arguments (table, columns in typed helpers, ordering, grouping,
/// returning) are validated; select expressions, join predicates and condition
/// fragments are trusted SQL written by the caller. The first invalid input is
/// remembered and reported by the `build*` methods.
#[derive(Debug)]
pub struct QueryBuilder {
    table: String,
    columns: Vec<String>,
    joins: Vec<(JoinKind, String, String)>,
    conditions: Vec<Condition>,
    group_by: Vec<String>,
    having: Vec<Condition>,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
    returning: Vec<String>,
    error: Option<DatabaseError>,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        let table = table.into();
        let error = validate_identifier(&table).err();
        Self {
            table,
            columns: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            returning: Vec::new(),
            error,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn fail(&mut self, err: DatabaseError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn identifier(&mut self, name: &str) -> bool {
        match validate_identifier(name) {
            Ok(()) => true,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// Select list expressions; `*` when never called. Expressions take no arguments,
    /// so a `$n` placeholder in one is an error.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            match check_placeholders(&column, 0) {
                Ok(()) => self.columns.push(column),
                Err(e) => self.fail(e),
            }
        }
        self
    }

    /// Add a condition written with local placeholders `$1..$k` for its `k` arguments.
    /// Conditions are combined with AND.
    pub fn and_where(mut self, condition: impl Into<String>, args: Vec<Value>) -> Self {
        let sql = condition.into();
        if let Err(e) = check_placeholders(&sql, args.len()) {
            self.fail(e);
            return self;
        }
        self.conditions.push(Condition {
            sql,
            args,
            atomic: false,
        });
        self
    }

    fn compare(mut self, column: &str, operator: &str, value: Value) -> Self {
        if self.identifier(column) {
            self.conditions.push(Condition {
                sql: format!("{} {} $1", column, operator),
                args: vec![value],
                atomic: true,
            });
        }
        self
    }

    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, "=", value.into())
    }

    pub fn where_ne(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, "<>", value.into())
    }

    pub fn where_gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, ">", value.into())
    }

    pub fn where_gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, ">=", value.into())
    }

    pub fn where_lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, "<", value.into())
    }

    pub fn where_lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.compare(column, "<=", value.into())
    }

    /// `column LIKE pattern`; the pattern is bound, so `%` and `_` keep their LIKE meaning
    pub fn where_like(self, column: &str, pattern: impl Into<String>) -> Self {
        self.compare(column, "LIKE", Value::Text(pattern.into()))
    }

    pub fn where_ilike(self, column: &str, pattern: impl Into<String>) -> Self {
        self.compare(column, "ILIKE", Value::Text(pattern.into()))
    }

    /// `column IN (...)`. An empty list matches nothing.
    pub fn where_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        if !self.identifier(column) {
            return self;
        }
        let args: Vec<Value> = values.into_iter().map(Into::into).collect();
        let sql = if args.is_empty() {
            "FALSE".to_string()
        } else {
            let list: Vec<String> = (1..=args.len()).map(|n| format!("${}", n)).collect();
            format!("{} IN ({})", column, list.join(", "))
        };
        self.conditions.push(Condition {
            sql,
            args,
            atomic: true,
        });
        self
    }

    pub fn where_null(mut self, column: &str) -> Self {
        if self.identifier(column) {
            self.conditions.push(Condition {
                sql: format!("{} IS NULL", column),
                args: Vec::new(),
                atomic: true,
            });
        }
        self
    }

    pub fn where_not_null(mut self, column: &str) -> Self {
        if self.identifier(column) {
            self.conditions.push(Condition {
                sql: format!("{} IS NOT NULL", column),
                args: Vec::new(),
                atomic: true,
            });
        }
        self
    }

    fn add_join(mut self, kind: JoinKind, table: &str, on: impl Into<String>) -> Self {
        let on = on.into();
        if let Err(e) = check_placeholders(&on, 0) {
            self.fail(e);
            return self;
        }
        if self.identifier(table) {
            self.joins.push((kind, table.to_string(), on));
        }
        self
    }

    /// Inner join; `on` is a trusted predicate and may not contain placeholders
    pub fn join(self, table: &str, on: impl Into<String>) -> Self {
        self.add_join(JoinKind::Inner, table, on)
    }

    pub fn left_join(self, table: &str, on: impl Into<String>) -> Self {
        self.add_join(JoinKind::Left, table, on)
    }

    pub fn right_join(self, table: &str, on: impl Into<String>) -> Self {
        self.add_join(JoinKind::Right, table, on)
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if self.identifier(&column) {
                self.group_by.push(column);
            }
        }
        self
    }

    /// HAVING condition with local placeholders, like [`QueryBuilder::and_where`]
    pub fn having(mut self, condition: impl Into<String>, args: Vec<Value>) -> Self {
        let sql = condition.into();
        if let Err(e) = check_placeholders(&sql, args.len()) {
            self.fail(e);
            return self;
        }
        self.having.push(Condition {
            sql,
            args,
            atomic: false,
        });
        self
    }

    pub fn order_by(self, column: &str) -> Self {
        self.order_by_direction(column, Direction::Asc)
    }

    pub fn order_by_desc(self, column: &str) -> Self {
        self.order_by_direction(column, Direction::Desc)
    }

    pub fn order_by_direction(mut self, column: &str, direction: Direction) -> Self {
        if self.identifier(column) {
            self.order_by.push((column.to_string(), direction));
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// RETURNING list for insert, update and delete; `*` is allowed
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            if column == "*" || self.identifier(&column) {
                self.returning.push(column);
            }
        }
        self
    }

    fn check(&self) -> Result<(), DatabaseError> {
        match &self.error {
            Some(DatabaseError::Validation { field, reason }) => {
                Err(DatabaseError::validation(field.clone(), reason.clone()))
            }
            Some(DatabaseError::Query { message, statement, .. }) => {
                Err(DatabaseError::query(statement.clone(), message.clone()))
            }
            Some(other) => Err(DatabaseError::query(self.table.clone(), other.to_string())),
            None => Ok(()),
        }
    }

    /// SELECT statement and its arguments, placeholders numbered from `$1`
    pub fn build(&self) -> Result<(String, Vec<Value>), DatabaseError> {
        self.check()?;
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", columns, self.table);
        let mut args = Vec::new();
        self.push_joins(&mut sql);
        push_conditions(&mut sql, " WHERE ", &self.conditions, &mut args);

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        push_conditions(&mut sql, " HAVING ", &self.having, &mut args);

        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|(column, direction)| match direction {
                    Direction::Asc => column.clone(),
                    Direction::Desc => format!("{} DESC", column),
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
        Ok((sql, args))
    }

    /// `SELECT COUNT(*)` over the same joins and conditions
    pub fn build_count(&self) -> Result<(String, Vec<Value>), DatabaseError> {
        self.check()?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let mut args = Vec::new();
        self.push_joins(&mut sql);
        push_conditions(&mut sql, " WHERE ", &self.conditions, &mut args);
        Ok((sql, args))
    }

    /// INSERT of the given columns in order. Conditions, joins and ordering are ignored.
    pub fn build_insert(
        &self,
        values: &[(String, Value)],
    ) -> Result<(String, Vec<Value>), DatabaseError> {
        self.check()?;
        if values.is_empty() {
            return Err(DatabaseError::validation(
                self.table.clone(),
                "insert requires at least one column",
            ));
        }
        let mut columns = Vec::with_capacity(values.len());
        let mut placeholders = Vec::with_capacity(values.len());
        let mut args = Vec::with_capacity(values.len());
        for (index, (column, value)) in values.iter().enumerate() {
            validate_identifier(column)?;
            columns.push(column.as_str());
            placeholders.push(format!("${}", index + 1));
            args.push(value.clone());
        }
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.push_returning(&mut sql);
        Ok((sql, args))
    }

    /// UPDATE setting the given columns, filtered by this builder's conditions.
    /// SET arguments come first, condition arguments after them.
    pub fn build_update(
        &self,
        values: &[(String, Value)],
    ) -> Result<(String, Vec<Value>), DatabaseError> {
        self.check()?;
        if values.is_empty() {
            return Err(DatabaseError::validation(
                self.table.clone(),
                "update requires at least one column",
            ));
        }
        let mut assignments = Vec::with_capacity(values.len());
        let mut args = Vec::with_capacity(values.len());
        for (index, (column, value)) in values.iter().enumerate() {
            validate_identifier(column)?;
            assignments.push(format!("{} = ${}", column, index + 1));
            args.push(value.clone());
        }
        let mut sql = format!("UPDATE {} SET {}", self.table, assignments.join(", "));
        push_conditions(&mut sql, " WHERE ", &self.conditions, &mut args);
        self.push_returning(&mut sql);
        Ok((sql, args))
    }

    /// DELETE filtered by this builder's conditions
    pub fn build_delete(&self) -> Result<(String, Vec<Value>), DatabaseError> {
        self.check()?;
        let mut sql = format!("DELETE FROM {}", self.table);
        let mut args = Vec::new();
        push_conditions(&mut sql, " WHERE ", &self.conditions, &mut args);
        self.push_returning(&mut sql);
        Ok((sql, args))
    }

    fn push_joins(&self, sql: &mut String) {
        for (kind, table, on) in &self.joins {
            sql.push_str(&format!(" {} {} ON {}", kind.keyword(), table, on));
        }
    }

    fn push_returning(&self, sql: &mut String) {
        if !self.returning.is_empty() {
            sql.push_str(" RETURNING ");
            sql.push_str(&self.returning.join(", "));
        }
    }
}

/// Append `keyword` and the AND-joined conditions, renumbering each fragment
/// after the arguments already collected
fn push_conditions(sql: &mut String, keyword: &str, conditions: &[Condition], args: &mut Vec<Value>) {
    if conditions.is_empty() {
        return;
    }
    let wrap = conditions.len() > 1;
    let rendered: Vec<String> = conditions
        .iter()
        .map(|condition| {
            let text = renumber(&condition.sql, args.len());
            args.extend(condition.args.iter().cloned());
            if wrap && !condition.atomic {
                format!("({})", text)
            } else {
                text
            }
        })
        .collect();
    sql.push_str(keyword);
    sql.push_str(&rendered.join(" AND "));
}
