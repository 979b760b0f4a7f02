//! Tenant account rows.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use crate::{advisory_xact_lock, ident_ok, Db, DbError};

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub object: Value,
    pub api_key_hashes: Vec<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Result of the dangerous-delete operation. One shape for every caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeletedAccountData {
    pub deleted_account_id: String,
    /// table name → rows removed.
    pub deleted_record_counts: Vec<(String, i64)>,
    pub warnings: Vec<String>,
}

impl Db {
    /// Create or refresh the tenant row from the provider account document,
    /// registering the api-key hash that authenticated the call.
    ///
    /// The account id must equal the document's `id` field; a mismatch is a
    /// caller bug and is rejected.
    pub async fn upsert_account(
        &self,
        account_id: &str,
        object: &Value,
        api_key_hash: &str,
    ) -> Result<(), DbError> {
        if object.get("id").and_then(Value::as_str) != Some(account_id) {
            return Err(DbError::Fatal(format!(
                "account document id does not match {account_id}"
            )));
        }

        sqlx::query(&format!(
            r#"
            insert into {schema}.accounts as a (id, object, api_key_hashes)
            values ($1, $2, array[$3])
            on conflict (id) do update set
                object = excluded.object,
                api_key_hashes = case
                    when $3 = any(a.api_key_hashes) then a.api_key_hashes
                    else array_append(a.api_key_hashes, $3)
                end
            "#,
            schema = self.schema(),
        ))
        .bind(account_id)
        .bind(object)
        .bind(api_key_hash)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn fetch_account(&self, account_id: &str) -> Result<Option<AccountRow>, DbError> {
        let row = sqlx::query(&format!(
            "select id, object, api_key_hashes, last_synced_at from {}.accounts where id = $1",
            self.schema(),
        ))
        .bind(account_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(AccountRow {
            id: row.try_get("id")?,
            object: row.try_get("object")?,
            api_key_hashes: row.try_get("api_key_hashes")?,
            last_synced_at: row.try_get("last_synced_at")?,
        }))
    }

    /// Find the tenant a key hash belongs to, if any.
    pub async fn find_account_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<String>, DbError> {
        let row: Option<(String,)> = sqlx::query_as(&format!(
            "select id from {}.accounts where $1 = any(api_key_hashes)",
            self.schema(),
        ))
        .bind(key_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Stamp the account's last successful sync.
    pub async fn touch_account_last_synced(&self, account_id: &str) -> Result<(), DbError> {
        sqlx::query(&format!(
            "update {}.accounts set last_synced_at = now() where id = $1",
            self.schema(),
        ))
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Remove every mirrored row for an account, then the account itself.
    ///
    /// `entity_tables` is the registry's table list; the gateway does not
    /// know object kinds. Destructive and unrecoverable — callers gate this
    /// behind an explicit operator action.
    pub async fn dangerously_delete_account_data(
        &self,
        account_id: &str,
        entity_tables: &[&str],
    ) -> Result<DeletedAccountData, DbError> {
        for table in entity_tables {
            if !ident_ok(table) {
                return Err(DbError::Fatal(format!("invalid table name: {table:?}")));
            }
        }

        let mut tx = self.pool().begin().await?;
        advisory_xact_lock(&mut tx, &format!("account:{account_id}")).await?;

        let mut warnings = Vec::new();
        let (open_runs,): (i64,) = sqlx::query_as(&format!(
            "select count(*)::bigint from {}.sync_runs where account_id = $1 and closed_at is null",
            self.schema(),
        ))
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;
        if open_runs > 0 {
            warnings.push(format!("deleted account had {open_runs} open sync run(s)"));
        }

        let mut deleted_record_counts = Vec::new();
        for table in entity_tables {
            let res = sqlx::query(&format!(
                "delete from {}.{} where account_id = $1",
                self.schema(),
                table,
            ))
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
            deleted_record_counts.push(((*table).to_string(), res.rows_affected() as i64));
        }

        for table in ["managed_webhooks", "object_runs", "sync_runs", "sync_cursors"] {
            let res = sqlx::query(&format!(
                "delete from {}.{} where account_id = $1",
                self.schema(),
                table,
            ))
            .bind(account_id)
            .execute(&mut *tx)
            .await?;
            deleted_record_counts.push((table.to_string(), res.rows_affected() as i64));
        }

        let res = sqlx::query(&format!(
            "delete from {}.accounts where id = $1",
            self.schema(),
        ))
        .bind(account_id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            warnings.push("account row did not exist".to_string());
        }

        tx.commit().await?;

        Ok(DeletedAccountData {
            deleted_account_id: account_id.to_string(),
            deleted_record_counts,
            warnings,
        })
    }
}
