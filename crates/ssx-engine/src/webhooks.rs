//! Managed webhook lifecycle.
//!
//! The system owns its provider-side endpoints: find-or-create keyed by
//! `(account, normalized url)`, reconcile against the remote, tolerate
//! endpoints deleted out-of-band, and delete both sides on teardown.
//!
//! Locking: the advisory lock covers only the row lookup / insert critical
//! sections, never a provider call. Exactly-one-endpoint is preserved by
//! re-checking the row after the remote create and deleting our endpoint if
//! another process won the race.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use ssx_db::{Db, ManagedWebhookRow};
use ssx_stripe::StripeClient;

/// Event types a managed endpoint subscribes to. `*` delegates filtering to
/// the event processor, which acknowledges unmirrored kinds.
pub const MANAGED_EVENT_TYPES: &[&str] = &["*"];

/// Canonical form a webhook url is stored under: lowercase scheme and host,
/// default port dropped, query/fragment stripped, no trailing slash.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s.to_ascii_lowercase(), r),
        None => ("https".to_string(), url),
    };

    let rest = rest
        .split_once('#')
        .map(|(before, _)| before)
        .unwrap_or(rest);
    let rest = rest
        .split_once('?')
        .map(|(before, _)| before)
        .unwrap_or(rest);

    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{p}")),
        None => (rest, String::new()),
    };

    let authority = authority.to_ascii_lowercase();
    let authority = match (scheme.as_str(), authority.rsplit_once(':')) {
        ("https", Some((host, "443"))) => host.to_string(),
        ("http", Some((host, "80"))) => host.to_string(),
        _ => authority,
    };

    let path = path.trim_end_matches('/');
    format!("{scheme}://{authority}{path}")
}

/// Find the managed endpoint for `(account, url)`, creating it remotely and
/// locally when absent. Returns the row, including the signing secret.
///
/// A stored row whose remote endpoint is gone (or whose secret cannot be
/// confirmed against the remote) is purged and recreated.
pub async fn find_or_create_managed_webhook(
    db: &Db,
    client: &StripeClient,
    account_id: &str,
    url: &str,
) -> Result<ManagedWebhookRow> {
    let url = normalize_url(url);

    if let Some(row) = db.find_managed_webhook(account_id, &url).await? {
        match client.retrieve_webhook_endpoint(&row.id).await {
            Ok(remote) => {
                let remote_url = remote.get("url").and_then(Value::as_str).unwrap_or("");
                if normalize_url(remote_url) == url {
                    return Ok(row);
                }
                warn!(
                    endpoint = %row.id,
                    stored = %url,
                    remote = remote_url,
                    "remote endpoint url drifted, recreating"
                );
            }
            Err(e) if e.is_resource_missing() => {
                warn!(endpoint = %row.id, "remote endpoint gone, purging orphaned row");
            }
            Err(e) => return Err(e).context("webhook endpoint verification failed"),
        }
        db.delete_managed_webhook_row(&row.id).await?;
    }

    let created = client
        .create_webhook_endpoint(&url, MANAGED_EVENT_TYPES)
        .await
        .context("webhook endpoint create failed")?;
    let id = created
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("webhook endpoint response without id"))?;
    let secret = created
        .get("secret")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("webhook endpoint response without secret"))?;

    // Row insert after the remote call. If a concurrent caller inserted the
    // same (account, url) first, keep theirs and remove our duplicate
    // endpoint so steady state holds exactly one.
    match db.insert_managed_webhook(id, &url, secret, account_id).await {
        Ok(()) => {
            info!(endpoint = id, %url, "managed webhook created");
            Ok(ManagedWebhookRow {
                id: id.to_string(),
                url: url.clone(),
                secret: secret.to_string(),
                account_id: account_id.to_string(),
                created_at: chrono::Utc::now(),
            })
        }
        Err(e) if matches!(e, ssx_db::DbError::Conflict { .. }) => {
            warn!(endpoint = id, %url, "lost webhook create race, deleting duplicate endpoint");
            client.delete_webhook_endpoint(id).await?;
            db.find_managed_webhook(account_id, &url)
                .await?
                .ok_or_else(|| anyhow!("webhook row vanished after create race"))
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete the endpoint remotely and locally. A missing remote endpoint is
/// tolerated; a missing row is a no-op.
pub async fn delete_managed_webhook(db: &Db, client: &StripeClient, id: &str) -> Result<()> {
    client
        .delete_webhook_endpoint(id)
        .await
        .context("webhook endpoint delete failed")?;
    if db.delete_managed_webhook_row(id).await? {
        info!(endpoint = id, "managed webhook deleted");
    }
    Ok(())
}
