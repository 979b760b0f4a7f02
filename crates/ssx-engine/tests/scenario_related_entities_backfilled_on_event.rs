//! Depth-1 related-entity backfill: an event referencing a row we have
//! never mirrored pulls that row in; references of the pulled row are left
//! for their own events (no fan-out).

mod common;

use std::sync::Arc;

use serde_json::json;

use ssx_engine::{EntityUpserter, UpsertOptions};
use ssx_stripe::ObjectKind;

use common::MockProvider;

#[tokio::test]
async fn missing_referenced_customer_is_fetched_and_mirrored() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("related");
    common::seed_account(&db, &account).await?;
    let customer_id = format!("cus_{account}");
    let charge_id = format!("ch_{account}");

    let provider = Arc::new(MockProvider::new());
    // The referenced customer exists upstream (retrievable) but is not yet
    // mirrored. It itself references nothing we track.
    provider.seed(
        ObjectKind::Customer,
        vec![json!({"id": customer_id, "object": "customer", "created": 50})],
    );

    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::clone(&provider),
        UpsertOptions {
            backfill_related_entities: true,
            ..UpsertOptions::default()
        },
    );

    let stats = upserter
        .upsert(
            &[json!({
                "id": charge_id,
                "object": "charge",
                "created": 2000,
                "customer": customer_id
            })],
            &account,
            2_000_000,
        )
        .await?;

    assert_eq!(stats.written(), 1);
    assert_eq!(stats.related_backfilled, 1);
    assert!(
        db.fetch_entity("customers", &customer_id).await?.is_some(),
        "referenced customer must be mirrored"
    );

    // Re-upserting does not refetch: the reference is now present.
    let stats = upserter
        .upsert(
            &[json!({
                "id": charge_id,
                "object": "charge",
                "created": 2000,
                "customer": customer_id
            })],
            &account,
            2_000_001,
        )
        .await?;
    assert_eq!(stats.related_backfilled, 0);
    Ok(())
}

#[tokio::test]
async fn unresolvable_reference_is_tolerated() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("dangling");
    common::seed_account(&db, &account).await?;
    let charge_id = format!("ch_{account}");

    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::new(MockProvider::new()),
        UpsertOptions {
            backfill_related_entities: true,
            ..UpsertOptions::default()
        },
    );

    // The referenced customer is gone upstream (resource_missing); the
    // charge itself must still land.
    let stats = upserter
        .upsert(
            &[json!({
                "id": charge_id,
                "object": "charge",
                "created": 2000,
                "customer": "cus_gone_forever"
            })],
            &account,
            2_000_000,
        )
        .await?;

    assert_eq!(stats.written(), 1);
    assert_eq!(stats.related_backfilled, 0);
    assert!(stats.errors.is_empty());
    assert!(db.fetch_entity("charges", &charge_id).await?.is_some());
    Ok(())
}
