//! Schema migrator.
//!
//! Applies the compiled DDL bundle in order on a single connection, under a
//! transaction-scoped advisory lock so concurrent processes serialize.
//! Applied names are tracked in `{schema}._migrations`; re-running is a
//! no-op. The bundle is templated on the schema name before execution.
//!
//! `apply_schema_description` additionally materializes tables declared by
//! an external schema description (e.g. generated from an API description).
//! That path is strictly additive: it creates missing tables and adds newly
//! declared nullable columns, and never drops or narrows anything.

use sqlx::Executor;
use tracing::{info, warn};

use crate::{advisory_xact_lock, ident_ok, Db, DbError};

/// Ordered DDL bundle, embedded at compile time.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_namespace", include_str!("../migrations/0001_namespace.sql")),
    ("0002_entities", include_str!("../migrations/0002_entities.sql")),
    ("0003_sync_runs", include_str!("../migrations/0003_sync_runs.sql")),
];

/// Externally produced description of additional tables to materialize.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableDescription>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<ColumnDescription>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    /// SQL type expression, e.g. `text`, `bigint`, `jsonb`.
    pub sql_type: String,
    pub nullable: bool,
}

impl Db {
    /// Apply every pending migration. Fatal on DDL failure.
    pub async fn migrate(&self) -> Result<(), DbError> {
        let mut tx = self.pool().begin().await?;
        advisory_xact_lock(&mut tx, "migrate").await?;

        // Bootstrap: namespace + tracking table must exist before the first
        // lookup. Both statements are idempotent.
        (&mut *tx).execute(format!("create schema if not exists {}", self.schema()).as_str())
            .await
            .map_err(fatal)?;
        (&mut *tx).execute(
            format!(
                "create table if not exists {}._migrations \
                 (name text primary key, applied_at timestamptz not null default now())",
                self.schema(),
            )
            .as_str(),
        )
        .await
        .map_err(fatal)?;

        for (name, template) in MIGRATIONS {
            let (applied,): (bool,) = sqlx::query_as(&format!(
                "select exists (select 1 from {}._migrations where name = $1)",
                self.schema(),
            ))
            .bind(*name)
            .fetch_one(&mut *tx)
            .await?;
            if applied {
                continue;
            }

            let sql = template.replace("{schema}", self.schema());
            (&mut *tx).execute(sql.as_str()).await.map_err(|e| {
                DbError::Fatal(format!("migration {name} failed: {e}"))
            })?;

            sqlx::query(&format!(
                "insert into {}._migrations (name) values ($1)",
                self.schema(),
            ))
            .bind(*name)
            .execute(&mut *tx)
            .await?;

            info!(migration = name, "applied");
        }

        tx.commit().await?;
        Ok(())
    }

    /// Additively materialize externally described tables.
    ///
    /// Each table gets `id text primary key` plus its declared nullable
    /// columns; non-nullable declarations are skipped with a warning since
    /// adding them to a populated table cannot succeed.
    pub async fn apply_schema_description(
        &self,
        desc: &SchemaDescription,
    ) -> Result<(), DbError> {
        let mut tx = self.pool().begin().await?;
        advisory_xact_lock(&mut tx, "migrate").await?;

        for table in &desc.tables {
            if !ident_ok(&table.name) {
                return Err(DbError::Fatal(format!(
                    "invalid described table name: {:?}",
                    table.name
                )));
            }

            (&mut *tx).execute(
                format!(
                    "create table if not exists {}.{} (id text primary key)",
                    self.schema(),
                    table.name,
                )
                .as_str(),
            )
            .await
            .map_err(fatal)?;

            for column in &table.columns {
                if column.name == "id" {
                    continue;
                }
                if !ident_ok(&column.name) || !sql_type_ok(&column.sql_type) {
                    return Err(DbError::Fatal(format!(
                        "invalid described column {}.{}: {}",
                        table.name, column.name, column.sql_type
                    )));
                }
                if !column.nullable {
                    warn!(
                        table = %table.name,
                        column = %column.name,
                        "skipping non-nullable described column; additive apply only"
                    );
                    continue;
                }

                (&mut *tx).execute(
                    format!(
                        "alter table {}.{} add column if not exists {} {}",
                        self.schema(),
                        table.name,
                        column.name,
                        column.sql_type,
                    )
                    .as_str(),
                )
                .await
                .map_err(fatal)?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

fn fatal(e: sqlx::Error) -> DbError {
    DbError::Fatal(e.to_string())
}

/// Allow only plain type expressions (`text`, `bigint`, `numeric(12,2)`,
/// `timestamptz`) in described columns.
fn sql_type_ok(t: &str) -> bool {
    !t.is_empty()
        && t.len() <= 64
        && t.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || " _(),".contains(c))
}
