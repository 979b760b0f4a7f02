//! Shared helpers for engine scenario tests: database bootstrap and an
//! in-process provider fake implementing the list/retrieve seam.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use ssx_db::Db;
use ssx_stripe::{ListPage, ListParams, ObjectKind, ProviderLister, StripeError};

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

/// Provider fake with real pagination semantics: newest-first ordering,
/// created-range filtering, `starting_after` continuation, `has_more`.
#[derive(Default)]
pub struct MockProvider {
    pub docs: Mutex<BTreeMap<ObjectKind, Vec<Value>>>,
    /// When set, every list call returns an empty page with `has_more =
    /// true` — the upstream contract violation the worker must refuse.
    pub force_empty_has_more: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, kind: ObjectKind, mut docs: Vec<Value>) {
        self.docs.lock().expect("mock lock").entry(kind).or_default().append(&mut docs);
    }
}

impl ProviderLister for MockProvider {
    async fn list_page(&self, kind: ObjectKind, params: &ListParams) -> Result<ListPage, StripeError> {
        if self.force_empty_has_more {
            return Ok(ListPage {
                data: vec![],
                has_more: true,
            });
        }

        let mut docs = self
            .docs
            .lock()
            .expect("mock lock")
            .get(&kind)
            .cloned()
            .unwrap_or_default();
        docs.sort_by_key(|d| std::cmp::Reverse(d.get("created").and_then(Value::as_i64).unwrap_or(0)));

        let mut filtered: Vec<Value> = docs
            .into_iter()
            .filter(|d| {
                let created = d.get("created").and_then(Value::as_i64).unwrap_or(0);
                params.created_lte.map_or(true, |lte| created <= lte)
                    && params.created_gte.map_or(true, |gte| created >= gte)
            })
            .collect();

        if let Some(after) = &params.starting_after {
            if let Some(pos) = filtered
                .iter()
                .position(|d| d.get("id").and_then(Value::as_str) == Some(after))
            {
                filtered.drain(..=pos);
            }
        }

        let limit = params.limit.unwrap_or(100).max(1) as usize;
        let has_more = filtered.len() > limit;
        filtered.truncate(limit);
        Ok(ListPage {
            data: filtered,
            has_more,
        })
    }

    async fn retrieve(&self, kind: ObjectKind, id: &str) -> Result<Value, StripeError> {
        self.docs
            .lock()
            .expect("mock lock")
            .get(&kind)
            .and_then(|docs| {
                docs.iter()
                    .find(|d| d.get("id").and_then(Value::as_str) == Some(id))
                    .cloned()
            })
            .ok_or(StripeError::Api {
                status: 404,
                code: Some("resource_missing".to_string()),
                message: format!("no such {kind}: {id}"),
            })
    }
}
