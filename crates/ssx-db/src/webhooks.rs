//! Managed webhook endpoint rows.
//!
//! The gateway stores one row per endpoint the system owns; the webhook
//! manager reconciles these against the provider and owns the lifecycle.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::{Db, DbError};

#[derive(Debug, Clone)]
pub struct ManagedWebhookRow {
    pub id: String,
    pub url: String,
    pub secret: String,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
}

impl Db {
    pub async fn insert_managed_webhook(
        &self,
        id: &str,
        url: &str,
        secret: &str,
        account_id: &str,
    ) -> Result<(), DbError> {
        sqlx::query(&format!(
            r#"
            insert into {}.managed_webhooks (id, url, secret, account_id)
            values ($1, $2, $3, $4)
            "#,
            self.schema(),
        ))
        .bind(id)
        .bind(url)
        .bind(secret)
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Row for `(account, normalized url)`, or `None`.
    pub async fn find_managed_webhook(
        &self,
        account_id: &str,
        url: &str,
    ) -> Result<Option<ManagedWebhookRow>, DbError> {
        let row = sqlx::query(&format!(
            r#"
            select id, url, secret, account_id, created_at
            from {}.managed_webhooks
            where account_id = $1 and url = $2
            "#,
            self.schema(),
        ))
        .bind(account_id)
        .bind(url)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(read_row(&row)?))
    }

    pub async fn fetch_managed_webhook(
        &self,
        id: &str,
    ) -> Result<Option<ManagedWebhookRow>, DbError> {
        let row = sqlx::query(&format!(
            r#"
            select id, url, secret, account_id, created_at
            from {}.managed_webhooks
            where id = $1
            "#,
            self.schema(),
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(read_row(&row)?))
    }

    pub async fn list_managed_webhooks(
        &self,
        account_id: &str,
    ) -> Result<Vec<ManagedWebhookRow>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            select id, url, secret, account_id, created_at
            from {}.managed_webhooks
            where account_id = $1
            order by created_at asc
            "#,
            self.schema(),
        ))
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(read_row).collect()
    }

    /// Idempotent removal; returns false when no row existed.
    pub async fn delete_managed_webhook_row(&self, id: &str) -> Result<bool, DbError> {
        let res = sqlx::query(&format!(
            "delete from {}.managed_webhooks where id = $1",
            self.schema(),
        ))
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() > 0)
    }
}

fn read_row(row: &sqlx::postgres::PgRow) -> Result<ManagedWebhookRow, DbError> {
    Ok(ManagedWebhookRow {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        secret: row.try_get("secret")?,
        account_id: row.try_get("account_id")?,
        created_at: row.try_get("created_at")?,
    })
}
