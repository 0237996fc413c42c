// Versioned schema migrations tracked in a bookkeeping table
//
// Migrations are supplied by the caller. Each one runs together with its
// bookkeeping insert in a single transaction, so a failed migration leaves no
// trace. The bookkeeping table's primary key is the cross-process guard: a
// concurrent apply of the same version fails its insert and rolls back.

use crate::args;
use crate::db::session::Session;
use crate::errors::{DatabaseError, UNIQUE_VIOLATION};
use crate::query::validate_identifier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

const MAX_VERSION_LEN: usize = 50;
const MAX_NAME_LEN: usize = 255;

/// A caller-supplied migration. Versions compare as text, so zero-pad them
/// (`001`, `002`, ...) or use timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(
        version: impl Into<String>,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            sql: sql.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: String,
    pub name: String,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub table: String,
    /// Ascending by version
    pub applied: Vec<AppliedMigration>,
    pub total_applied: usize,
}

impl MigrationStatus {
    pub fn versions(&self) -> Vec<&str> {
        self.applied.iter().map(|m| m.version.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct MigrationManager {
    table: String,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self {
            table: DEFAULT_MIGRATIONS_TABLE.to_string(),
        }
    }
}

fn validate_migration(version: &str, name: &str, sql: &str) -> Result<(), DatabaseError> {
    if version.trim().is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(DatabaseError::validation(
            "version",
            format!("must be 1-{} characters", MAX_VERSION_LEN),
        ));
    }
    if name.trim().is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DatabaseError::validation(
            "name",
            format!("must be 1-{} characters", MAX_NAME_LEN),
        ));
    }
    if sql.trim().is_empty() {
        return Err(DatabaseError::validation("sql", "migration SQL is empty"));
    }
    Ok(())
}

impl MigrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track migrations in a table other than `schema_migrations`
    pub fn with_table(table: impl Into<String>) -> Result<Self, DatabaseError> {
        let table = table.into();
        validate_identifier(&table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the bookkeeping table if it does not exist. Safe to call repeatedly.
    #[instrument(skip(self, session), fields(table = %self.table))]
    pub async fn initialize(&self, session: &mut Session) -> Result<(), DatabaseError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             version VARCHAR(50) PRIMARY KEY, \
             name VARCHAR(255) NOT NULL, \
             applied_at TIMESTAMPTZ DEFAULT NOW())",
            self.table
        );
        session.execute_script(&sql).await?;
        debug!("Migration bookkeeping table ready");
        Ok(())
    }

    /// Applied migrations, ascending by version
    pub async fn applied_migrations(
        &self,
        session: &mut Session,
    ) -> Result<Vec<AppliedMigration>, DatabaseError> {
        let sql = format!(
            "SELECT version, name, applied_at FROM {} ORDER BY version",
            self.table
        );
        let rows = session.fetch(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                Ok(AppliedMigration {
                    version: row.try_get("version")?,
                    name: row.try_get("name")?,
                    applied_at: row.try_get("applied_at")?,
                })
            })
            .collect()
    }

    pub async fn is_applied(
        &self,
        session: &mut Session,
        version: &str,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE version = $1)",
            self.table
        );
        let value = session.fetch_value(&sql, &args![version]).await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Run `sql` and record `version` in one transaction
    ///
    /// # Errors
    /// - `MigrationAlreadyApplied` if the version is recorded, checked before
    ///   the migration SQL runs (or detected by the bookkeeping insert when
    ///   another process applied it concurrently)
    /// - `Validation` for an empty version, name or body
    /// - `Query`/`Connection` if the migration fails; nothing is recorded
    #[instrument(skip(self, session, sql), fields(table = %self.table))]
    pub async fn apply_migration(
        &self,
        session: &mut Session,
        version: &str,
        name: &str,
        sql: &str,
    ) -> Result<(), DatabaseError> {
        validate_migration(version, name, sql)?;

        let mut tx = session.begin().await?;
        if self.is_applied(&mut tx, version).await? {
            tx.rollback().await?;
            return Err(DatabaseError::MigrationAlreadyApplied {
                version: version.to_string(),
            });
        }

        info!(version, name, "Applying migration");
        let insert = format!(
            "INSERT INTO {} (version, name) VALUES ($1, $2)",
            self.table
        );
        let outcome = async {
            tx.execute_script(sql).await?;
            tx.execute(&insert, &args![version, name]).await?;
            Ok::<_, DatabaseError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                tx.commit().await?;
                info!(version, "Migration applied");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(version, error = %rollback_err, "Rollback of failed migration also failed");
                }
                if e.sql_state() == Some(UNIQUE_VIOLATION) {
                    return Err(DatabaseError::MigrationAlreadyApplied {
                        version: version.to_string(),
                    });
                }
                warn!(version, error = %e, "Migration failed");
                Err(e)
            }
        }
    }

    /// Apply every migration not yet recorded, in order. Versions must be
    /// strictly ascending and none may sort below an already applied version.
    /// Returns the versions applied by this call.
    #[instrument(skip(self, session, migrations), fields(table = %self.table, supplied = migrations.len()))]
    pub async fn apply_pending(
        &self,
        session: &mut Session,
        migrations: &[Migration],
    ) -> Result<Vec<String>, DatabaseError> {
        if let Some(pair) = migrations.windows(2).find(|w| w[0].version >= w[1].version) {
            return Err(DatabaseError::validation(
                "version",
                format!(
                    "migrations must be strictly ascending: '{}' is followed by '{}'",
                    pair[0].version, pair[1].version
                ),
            ));
        }

        let applied = self.applied_migrations(session).await?;
        let known: HashSet<&str> = applied.iter().map(|m| m.version.as_str()).collect();
        let latest = applied.last().map(|m| m.version.clone());

        let mut newly_applied = Vec::new();
        for migration in migrations {
            if known.contains(migration.version.as_str()) {
                debug!(version = %migration.version, "Migration already applied, skipping");
                continue;
            }
            if let Some(latest) = &latest {
                if migration.version < *latest {
                    return Err(DatabaseError::validation(
                        "version",
                        format!(
                            "'{}' sorts before the already applied '{}'",
                            migration.version, latest
                        ),
                    ));
                }
            }
            self.apply_migration(session, &migration.version, &migration.name, &migration.sql)
                .await?;
            newly_applied.push(migration.version.clone());
        }
        Ok(newly_applied)
    }

    /// Run `down_sql` and forget `version` in one transaction.
    /// Returns false (and runs nothing) if the version was not applied.
    /// An empty `down_sql` is a `Validation` error.
    #[instrument(skip(self, session, down_sql), fields(table = %self.table))]
    pub async fn revert_migration(
        &self,
        session: &mut Session,
        version: &str,
        down_sql: &str,
    ) -> Result<bool, DatabaseError> {
        if down_sql.trim().is_empty() {
            return Err(DatabaseError::validation(
                "down_sql",
                "a revert needs a script that undoes the migration",
            ));
        }

        let mut tx = session.begin().await?;
        if !self.is_applied(&mut tx, version).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        let delete = format!("DELETE FROM {} WHERE version = $1", self.table);
        let outcome = async {
            tx.execute_script(down_sql).await?;
            tx.execute(&delete, &args![version]).await?;
            Ok::<_, DatabaseError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                tx.commit().await?;
                info!(version, "Migration reverted");
                Ok(true)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(version, error = %rollback_err, "Rollback of failed revert also failed");
                }
                Err(e)
            }
        }
    }

    pub async fn get_migration_status(
        &self,
        session: &mut Session,
    ) -> Result<MigrationStatus, DatabaseError> {
        let applied = self.applied_migrations(session).await?;
        Ok(MigrationStatus {
            table: self.table.clone(),
            total_applied: applied.len(),
            applied,
        })
    }
}
