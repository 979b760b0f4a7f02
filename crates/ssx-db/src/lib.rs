//! Database gateway.
//!
//! Exclusive owner of all persistence: pooled connections, transaction
//! scopes, advisory locks, the timestamp-guarded entity upsert, the sync
//! run / object run tables, managed webhook rows, and the migrator. Other
//! crates share a [`Db`] by reference and never issue SQL of their own.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Postgres, Transaction};

pub mod account;
pub mod entity;
pub mod error;
pub mod migrate;
pub mod ratelimit;
pub mod runs;
pub mod webhooks;

pub use account::{AccountRow, DeletedAccountData};
pub use entity::{EntityRow, UpsertOutcome};
pub use error::DbError;
pub use migrate::{ColumnDescription, SchemaDescription, TableDescription};
pub use ratelimit::RateLimit;
pub use runs::{ClaimedTask, ObjectRunStatus, ObjectSlice, RunSummary, SyncRunKey};
pub use webhooks::ManagedWebhookRow;

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Default logical namespace for every table this crate owns.
pub const DEFAULT_SCHEMA: &str = "stripe";

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Per-statement timeout applied to every pooled connection.
const STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle over the pool plus the schema namespace all queries live in.
///
/// Cheap to clone; the pool is internally shared.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    schema: String,
}

impl Db {
    /// Connect with an explicit url, pool size, and namespace.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        schema: &str,
    ) -> Result<Self, DbError> {
        if !ident_ok(schema) {
            return Err(DbError::Fatal(format!("invalid schema name: {schema:?}")));
        }

        let timeout_ms = STATEMENT_TIMEOUT.as_millis();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(format!("set statement_timeout = {timeout_ms}").as_str())
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| DbError::Fatal(format!("failed to connect to Postgres: {e}")))?;

        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// Connect using `DATABASE_URL` and defaults.
    pub async fn connect_from_env() -> Result<Self, DbError> {
        let url = std::env::var(ENV_DB_URL)
            .map_err(|_| DbError::Fatal(format!("missing env var {ENV_DB_URL}")))?;
        Self::connect(&url, DEFAULT_MAX_CONNECTIONS, DEFAULT_SCHEMA).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Cooperative shutdown: wait for checked-out connections, then close.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Connectivity probe used by the CLI and the daemon health path.
    pub async fn ping(&self) -> Result<(), DbError> {
        sqlx::query_as::<_, (i32,)>("select 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

/// Take a transaction-scoped advisory lock keyed by name.
///
/// Released automatically on commit or rollback. Discipline: lock, then
/// work, then commit; the lock is never held across a provider HTTP call.
pub async fn advisory_xact_lock(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> Result<(), DbError> {
    sqlx::query("select pg_advisory_xact_lock($1)")
        .bind(advisory_key(name))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// FNV-1a over the lock name, folded into the signed 64-bit key space
/// Postgres advisory locks use.
fn advisory_key(name: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash as i64
}

/// Conservative identifier check for the few places a name is interpolated
/// into SQL text (schema, table, column). Bind parameters cover everything
/// else.
pub(crate) fn ident_ok(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_stable_and_distinct() {
        assert_eq!(advisory_key("acct_1"), advisory_key("acct_1"));
        assert_ne!(advisory_key("acct_1"), advisory_key("acct_2"));
    }

    #[test]
    fn ident_check_rejects_injection() {
        assert!(ident_ok("stripe"));
        assert!(ident_ok("_private"));
        assert!(ident_ok("object_runs"));
        assert!(!ident_ok(""));
        assert!(!ident_ok("Stripe"));
        assert!(!ident_ok("a;drop table"));
        assert!(!ident_ok("a\"b"));
        assert!(!ident_ok("1abc"));
    }
}
