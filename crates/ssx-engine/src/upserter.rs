//! Entity upserter.
//!
//! Maps raw provider documents onto entity tables through the gateway's
//! timestamp-guarded upsert. Documents are grouped by their `object`
//! discriminator; the raw document is stored verbatim and related rows are
//! never constructed in memory — cyclic references resolve through the
//! depth-1 related-entity backfill hook instead.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use ssx_db::{Db, DbError, EntityRow, UpsertOutcome};
use ssx_stripe::{ObjectKind, ProviderLister};

/// Feature switches for one upserter instance.
///
/// The bulk-sync path runs with the related-entity hook disabled; the event
/// path enables it per configuration.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    pub backfill_related_entities: bool,
    pub revalidate_via_provider: bool,
    pub auto_expand_lists: bool,
}

/// Aggregated outcome of one batch.
#[derive(Debug, Default, Clone)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_older: usize,
    /// Rows that failed after the retry-after-parent attempt; `(id, error)`.
    pub errors: Vec<(String, String)>,
    /// Referenced rows fetched and written by the depth-1 hook.
    pub related_backfilled: usize,
}

impl UpsertStats {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    fn absorb(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::SkippedOlder => self.skipped_older += 1,
        }
    }
}

pub struct EntityUpserter<L> {
    db: Db,
    lister: Arc<L>,
    opts: UpsertOptions,
}

impl<L: ProviderLister> EntityUpserter<L> {
    pub fn new(db: Db, lister: Arc<L>, opts: UpsertOptions) -> Self {
        Self { db, lister, opts }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn lister(&self) -> &L {
        &self.lister
    }

    /// Write a batch of provider documents for one account.
    ///
    /// `last_synced_at` is unix milliseconds and is the last-writer-wins
    /// guard value for every row in the batch. Per-row failures are
    /// aggregated in the returned stats; the batch commits what succeeded.
    pub async fn upsert(
        &self,
        items: &[Value],
        account_id: &str,
        last_synced_at: i64,
    ) -> Result<UpsertStats, DbError> {
        self.upsert_at_depth(items, account_id, last_synced_at, true)
            .await
    }

    /// `allow_hooks = false` is the depth-1 recursion used by the related
    /// backfill; it prevents fan-out storms by never recursing further.
    ///
    /// Manually boxed (rather than `async fn`) to break the Send-inference
    /// cycle created by the mutual recursion with `backfill_related`.
    fn upsert_at_depth<'a>(
        &'a self,
        items: &'a [Value],
        account_id: &'a str,
        last_synced_at: i64,
        allow_hooks: bool,
    ) -> Pin<Box<dyn Future<Output = Result<UpsertStats, DbError>> + Send + 'a>> {
        Box::pin(async move {
        let mut groups: BTreeMap<ObjectKind, Vec<Value>> = BTreeMap::new();
        for item in items {
            match item.get("object").and_then(Value::as_str).and_then(ObjectKind::parse) {
                Some(kind) => groups.entry(kind).or_default().push(item.clone()),
                None => {
                    warn!(
                        discriminator = item.get("object").and_then(|v| v.as_str()),
                        "skipping document of unknown kind"
                    );
                }
            }
        }

        if allow_hooks && self.opts.auto_expand_lists {
            expand_embedded_lists(&mut groups);
        }

        let mut stats = UpsertStats::default();
        for (kind, mut docs) in groups {
            if allow_hooks && self.opts.revalidate_via_provider {
                self.revalidate(kind, &mut docs).await;
            }
            self.upsert_group(kind, &docs, account_id, last_synced_at, allow_hooks, &mut stats)
                .await?;

            if allow_hooks && self.opts.backfill_related_entities {
                let backfilled = self
                    .backfill_related(kind, &docs, account_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(kind = %kind, error = %e, "related-entity backfill failed");
                        0
                    });
                stats.related_backfilled += backfilled;
            }
        }
        Ok(stats)
        })
    }

    /// One kind's documents through the guarded multi-row upsert, with a
    /// per-row salvage path when the batch statement is rejected by a
    /// missing parent.
    async fn upsert_group(
        &self,
        kind: ObjectKind,
        docs: &[Value],
        account_id: &str,
        last_synced_at: i64,
        allow_hooks: bool,
        stats: &mut UpsertStats,
    ) -> Result<(), DbError> {
        let rows = build_rows(docs, account_id, last_synced_at);
        if rows.is_empty() {
            return Ok(());
        }

        match self
            .db
            .upsert_entity_rows(kind.table_name(), kind.soft_deletable(), &rows)
            .await
        {
            Ok(outcomes) => {
                for outcome in outcomes {
                    stats.absorb(outcome);
                }
                Ok(())
            }
            Err(e) if e.is_foreign_key_violation() => {
                debug!(kind = %kind, error = %e, "batch rejected by missing parent, salvaging per row");
                for row in &rows {
                    self.upsert_row_with_parent_retry(kind, row, account_id, allow_hooks, stats)
                        .await;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Upsert one row; on a foreign-key rejection, backfill the parents it
    /// references and retry once. Two failures mark the row errored.
    async fn upsert_row_with_parent_retry(
        &self,
        kind: ObjectKind,
        row: &EntityRow,
        account_id: &str,
        allow_hooks: bool,
        stats: &mut UpsertStats,
    ) {
        let table = kind.table_name();
        let rows = std::slice::from_ref(row);

        let first = self
            .db
            .upsert_entity_rows(table, kind.soft_deletable(), rows)
            .await;
        match first {
            Ok(outcomes) => {
                for o in outcomes {
                    stats.absorb(o);
                }
                return;
            }
            Err(e) if e.is_foreign_key_violation() && allow_hooks => {
                warn!(kind = %kind, id = %row.id, "missing parent row, backfilling and retrying");
                if let Err(be) = self
                    .backfill_related(kind, std::slice::from_ref(&row.object), account_id)
                    .await
                {
                    stats.errors.push((row.id.clone(), be.to_string()));
                    return;
                }
            }
            Err(e) => {
                stats.errors.push((row.id.clone(), e.to_string()));
                return;
            }
        }

        match self
            .db
            .upsert_entity_rows(table, kind.soft_deletable(), rows)
            .await
        {
            Ok(outcomes) => {
                for o in outcomes {
                    stats.absorb(o);
                }
            }
            Err(e) => stats.errors.push((row.id.clone(), e.to_string())),
        }
    }

    /// Depth-1 hook: fetch-and-upsert referenced rows that are not yet
    /// mirrored. Returns how many rows were written.
    async fn backfill_related(
        &self,
        kind: ObjectKind,
        docs: &[Value],
        account_id: &str,
    ) -> Result<usize, DbError> {
        let mut refs: BTreeMap<ObjectKind, Vec<String>> = BTreeMap::new();
        for doc in docs {
            for (target, id) in related_refs(kind, doc) {
                let ids = refs.entry(target).or_default();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        let mut written = 0;
        for (target, ids) in refs {
            let present = self.db.entity_ids_present(target.table_name(), &ids).await?;
            for id in ids.iter().filter(|id| !present.contains(id)) {
                match self.lister.retrieve(target, id).await {
                    Ok(doc) => {
                        let now_ms = Utc::now().timestamp_millis();
                        // Boxed: the depth-1 re-entry would otherwise make
                        // this future's type recursive.
                        let nested: Pin<
                            Box<dyn Future<Output = Result<UpsertStats, DbError>> + Send + '_>,
                        > = Box::pin(self.upsert_at_depth(
                            std::slice::from_ref(&doc),
                            account_id,
                            now_ms,
                            false,
                        ));
                        written += nested.await?.written();
                    }
                    Err(e) => {
                        warn!(kind = %target, id = %id, error = %e, "related fetch failed");
                    }
                }
            }
        }
        Ok(written)
    }

    /// Replace payloads with the authoritative current documents.
    async fn revalidate(&self, kind: ObjectKind, docs: &mut [Value]) {
        for doc in docs.iter_mut() {
            let Some(id) = doc.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            match self.lister.retrieve(kind, &id).await {
                Ok(fresh) => *doc = fresh,
                Err(e) => {
                    warn!(kind = %kind, id = %id, error = %e, "revalidation fetch failed, keeping payload");
                }
            }
        }
    }

    /// Flag a mirrored row deleted. Returns false when the row was never
    /// mirrored (nothing to flag) or the kind keeps hard history.
    pub async fn soft_delete(&self, kind: ObjectKind, id: &str) -> Result<bool, DbError> {
        if !kind.soft_deletable() {
            warn!(kind = %kind, id, "ignoring deletion event for kind without a deleted flag");
            return Ok(false);
        }
        self.db.soft_delete_entity(kind.table_name(), id).await
    }
}

/// Rows for one group, deduplicated by id (last occurrence wins; within one
/// batch all rows share the guard timestamp, so order is arbitrary).
/// Postgres rejects a multi-row ON CONFLICT statement that touches the same
/// row twice, so the dedupe is required, not cosmetic.
fn build_rows(docs: &[Value], account_id: &str, last_synced_at: i64) -> Vec<EntityRow> {
    let mut rows: Vec<EntityRow> = Vec::with_capacity(docs.len());
    for doc in docs {
        let Some(id) = doc.get("id").and_then(Value::as_str) else {
            warn!("skipping document without id");
            continue;
        };
        let row = EntityRow {
            id: id.to_string(),
            account_id: account_id.to_string(),
            object: doc.clone(),
            last_synced_at,
            deleted: false,
        };
        match rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }
    rows
}

/// `(kind, id)` pairs a document references, per the registry's field map.
/// Expanded references contribute their `id` field; the expansion itself is
/// not trusted as a current document.
fn related_refs(kind: ObjectKind, doc: &Value) -> Vec<(ObjectKind, String)> {
    let mut out = Vec::new();
    for (field, target) in kind.related_refs() {
        let id = match doc.get(*field) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        if let Some(id) = id {
            out.push((*target, id));
        }
    }
    out
}

/// Append items of embedded list fields (`{"object":"list","data":[…]}`)
/// to their own kind groups, e.g. a subscription's `items`.
fn expand_embedded_lists(groups: &mut BTreeMap<ObjectKind, Vec<Value>>) {
    let mut extra: Vec<(ObjectKind, Value)> = Vec::new();
    for docs in groups.values() {
        for doc in docs {
            let Some(map) = doc.as_object() else { continue };
            for field in map.values() {
                if field.get("object").and_then(Value::as_str) != Some("list") {
                    continue;
                }
                let Some(data) = field.get("data").and_then(Value::as_array) else {
                    continue;
                };
                for item in data {
                    if let Some(kind) = item
                        .get("object")
                        .and_then(Value::as_str)
                        .and_then(ObjectKind::parse)
                    {
                        extra.push((kind, item.clone()));
                    }
                }
            }
        }
    }
    for (kind, item) in extra {
        groups.entry(kind).or_default().push(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn build_rows_dedupes_by_id() {
        let docs = vec![
            json!({"id": "cus_1", "object": "customer", "email": "a@x"}),
            json!({"id": "cus_2", "object": "customer"}),
            json!({"id": "cus_1", "object": "customer", "email": "b@x"}),
        ];
        let rows = build_rows(&docs, "acct_1", 1000);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].object["email"], "b@x");
    }

    #[test]
    fn build_rows_skips_idless_documents() {
        let docs = vec![json!({"object": "customer"})];
        assert!(build_rows(&docs, "acct_1", 0).is_empty());
    }

    #[test]
    fn related_refs_reads_plain_and_expanded() {
        let doc = json!({
            "id": "ch_1",
            "object": "charge",
            "customer": "cus_9",
            "invoice": {"id": "in_3", "object": "invoice"},
            "payment_intent": null
        });
        let refs = related_refs(ObjectKind::Charge, &doc);
        assert!(refs.contains(&(ObjectKind::Customer, "cus_9".into())));
        assert!(refs.contains(&(ObjectKind::Invoice, "in_3".into())));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn embedded_lists_expand_into_their_kind() {
        let mut groups = BTreeMap::new();
        groups.insert(
            ObjectKind::Subscription,
            vec![json!({
                "id": "sub_1",
                "object": "subscription",
                "items": {
                    "object": "list",
                    "data": [
                        {"id": "si_1", "object": "subscription_item", "subscription": "sub_1"}
                    ],
                    "has_more": false
                }
            })],
        );
        expand_embedded_lists(&mut groups);
        let items = groups.get(&ObjectKind::SubscriptionItem).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "si_1");
    }
}
