//! Timestamp-guarded entity writes.
//!
//! Every write goes through one shape:
//! `INSERT … ON CONFLICT (id) DO UPDATE … WHERE t.last_synced_at <=
//! excluded.last_synced_at`. The guard enforces last-writer-wins without an
//! application-level compare-and-swap; a rejected update is reported as
//! skipped, not as an error.

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::{ident_ok, Db, DbError};

/// One row bound for an entity table.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: String,
    pub account_id: String,
    /// Raw provider document, stored verbatim.
    pub object: Value,
    /// Unix milliseconds; the last-writer-wins guard value.
    pub last_synced_at: i64,
    pub deleted: bool,
}

/// Per-row result of a guarded upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row carried a newer `last_synced_at`; nothing was written.
    SkippedOlder,
}

impl Db {
    /// Multi-row guarded upsert into one entity table.
    ///
    /// Rows must be pre-deduplicated by id (callers keep the newest
    /// `last_synced_at` per id); Postgres rejects a statement that updates
    /// the same row twice through ON CONFLICT.
    ///
    /// Returns one outcome per input row, in input order.
    pub async fn upsert_entity_rows(
        &self,
        table: &str,
        soft_deletable: bool,
        rows: &[EntityRow],
    ) -> Result<Vec<UpsertOutcome>, DbError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        check_table(table)?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "insert into {}.{} as t (id, account_id, object, last_synced_at{}) ",
            self.schema(),
            table,
            if soft_deletable { ", deleted" } else { "" },
        ));
        qb.push_values(rows, |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.account_id)
                .push_bind(&row.object)
                .push_bind(row.last_synced_at);
            if soft_deletable {
                b.push_bind(row.deleted);
            }
        });
        qb.push(
            " on conflict (id) do update set \
               account_id = excluded.account_id, \
               object = excluded.object, \
               last_synced_at = excluded.last_synced_at",
        );
        if soft_deletable {
            qb.push(", deleted = excluded.deleted");
        }
        qb.push(
            " where t.last_synced_at <= excluded.last_synced_at \
              returning id, (xmax = 0) as inserted",
        );

        let written = qb.build().fetch_all(self.pool()).await?;

        // Rows filtered out by the guard are absent from RETURNING.
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let hit = written.iter().find_map(|w| {
                let id: String = w.try_get("id").ok()?;
                (id == row.id).then(|| w.try_get::<bool, _>("inserted").unwrap_or(false))
            });
            outcomes.push(match hit {
                Some(true) => UpsertOutcome::Inserted,
                Some(false) => UpsertOutcome::Updated,
                None => UpsertOutcome::SkippedOlder,
            });
        }
        Ok(outcomes)
    }

    /// Flag a row deleted without removing it. Returns false when the row
    /// was never mirrored.
    pub async fn soft_delete_entity(&self, table: &str, id: &str) -> Result<bool, DbError> {
        check_table(table)?;
        let res = sqlx::query(&format!(
            "update {}.{} set deleted = true where id = $1",
            self.schema(),
            table,
        ))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Fetch one raw document, or `None`.
    pub async fn fetch_entity(&self, table: &str, id: &str) -> Result<Option<Value>, DbError> {
        check_table(table)?;
        let row: Option<(Value,)> = sqlx::query_as(&format!(
            "select object from {}.{} where id = $1",
            self.schema(),
            table,
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(object,)| object))
    }

    /// Fetch one row's guard timestamp, or `None`.
    pub async fn fetch_entity_last_synced_at(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<i64>, DbError> {
        check_table(table)?;
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "select last_synced_at from {}.{} where id = $1",
            self.schema(),
            table,
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Of `ids`, return the subset already present in `table`.
    ///
    /// The related-entity backfill hook uses this to fetch only referenced
    /// rows that are actually missing.
    pub async fn entity_ids_present(
        &self,
        table: &str,
        ids: &[String],
    ) -> Result<Vec<String>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        check_table(table)?;
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "select id from {}.{} where id = any($1)",
            self.schema(),
            table,
        ))
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Row count for one entity table scoped to an account.
    pub async fn count_entities(&self, table: &str, account_id: &str) -> Result<i64, DbError> {
        check_table(table)?;
        let (n,): (i64,) = sqlx::query_as(&format!(
            "select count(*)::bigint from {}.{} where account_id = $1",
            self.schema(),
            table,
        ))
        .bind(account_id)
        .fetch_one(self.pool())
        .await?;
        Ok(n)
    }
}

fn check_table(table: &str) -> Result<(), DbError> {
    if ident_ok(table) {
        Ok(())
    } else {
        Err(DbError::Fatal(format!("invalid table name: {table:?}")))
    }
}
