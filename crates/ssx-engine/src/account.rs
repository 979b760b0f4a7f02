//! Tenant bootstrap.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::info;

use ssx_db::Db;
use ssx_stripe::{api_key_hash, StripeClient};

/// Ensure the tenant row exists for the authenticated key.
///
/// Fetches the provider account document, creates or refreshes the row, and
/// registers the key's hash. Returns the account id. This is the first call
/// every authenticated flow makes; nothing else creates accounts.
pub async fn ensure_account(db: &Db, client: &StripeClient, api_key: &str) -> Result<String> {
    let doc = client
        .fetch_account()
        .await
        .context("provider account fetch failed")?;
    let account_id = doc
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("account document without id"))?
        .to_string();

    db.upsert_account(&account_id, &doc, &api_key_hash(api_key))
        .await
        .context("account row upsert failed")?;

    info!(account = %account_id, "account ensured");
    Ok(account_id)
}
