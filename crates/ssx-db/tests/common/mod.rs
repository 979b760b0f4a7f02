//! Shared helpers for the gateway scenario tests.
//!
//! Tests run against the database named by `DATABASE_URL` and skip politely
//! when it is unset (local + CI friendly). Rows are isolated per test by
//! unique account ids, never by truncation.

#![allow(dead_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use ssx_db::Db;

pub async fn test_db() -> anyhow::Result<Option<Db>> {
    if std::env::var(ssx_db::ENV_DB_URL).is_err() {
        eprintln!("SKIP: DATABASE_URL not set");
        return Ok(None);
    }
    let db = Db::connect_from_env().await?;
    db.migrate().await?;
    Ok(Some(db))
}

pub fn unique_account(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    format!("acct_{tag}_{nanos}")
}

pub async fn seed_account(db: &Db, account_id: &str) -> anyhow::Result<()> {
    db.upsert_account(
        account_id,
        &serde_json::json!({"id": account_id, "object": "account"}),
        "test_key_hash",
    )
    .await?;
    Ok(())
}
