//! Event-path ordering laws: an out-of-order delivery never regresses a
//! row, and redelivering the same signed event leaves the database
//! identical.

mod common;

use std::sync::Arc;

use serde_json::json;

use ssx_engine::{process_signed_event, EntityUpserter, EventError, UpsertOptions};
use ssx_stripe::webhook::sign_payload;

use common::MockProvider;

const SECRET: &str = "whsec_scenario_secret";

fn signed(body: &serde_json::Value) -> (Vec<u8>, String) {
    let raw = serde_json::to_vec(body).expect("serialize");
    let ts = chrono::Utc::now().timestamp();
    let header = format!("t={ts},v1={}", sign_payload(SECRET, ts, &raw));
    (raw, header)
}

fn charge_event(event_id: &str, charge_id: &str, created: i64, paid: bool) -> serde_json::Value {
    json!({
        "id": event_id,
        "type": "charge.updated",
        "created": created,
        "data": {"object": {"id": charge_id, "object": "charge", "paid": paid, "created": created}}
    })
}

#[tokio::test]
async fn out_of_order_event_does_not_regress() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("ooo");
    common::seed_account(&db, &account).await?;
    let charge_id = format!("ch_{account}");

    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::new(MockProvider::new()),
        UpsertOptions::default(),
    );

    let (raw, header) = signed(&charge_event("evt_new", &charge_id, 2000, true));
    process_signed_event(&upserter, &account, &raw, &header, SECRET).await?;

    // Same charge, older event clock, contradicting data.
    let (raw, header) = signed(&charge_event("evt_old", &charge_id, 1940, false));
    process_signed_event(&upserter, &account, &raw, &header, SECRET).await?;

    let doc = db.fetch_entity("charges", &charge_id).await?.expect("row exists");
    assert_eq!(doc["paid"], true);
    assert_eq!(
        db.fetch_entity_last_synced_at("charges", &charge_id).await?,
        Some(2_000_000),
        "guard timestamp is the event clock in milliseconds"
    );
    Ok(())
}

#[tokio::test]
async fn redelivered_event_is_a_no_op() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("replay");
    common::seed_account(&db, &account).await?;
    let customer_id = format!("cus_{account}");

    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::new(MockProvider::new()),
        UpsertOptions::default(),
    );

    let body = json!({
        "id": "evt_dup",
        "type": "customer.updated",
        "created": 1_700_000_100,
        "data": {"object": {"id": customer_id, "object": "customer", "email": "x@example.com"}}
    });

    let (raw, header) = signed(&body);
    let first = process_signed_event(&upserter, &account, &raw, &header, SECRET).await?;
    let after_first = db.fetch_entity("customers", &customer_id).await?;
    let ls_first = db.fetch_entity_last_synced_at("customers", &customer_id).await?;

    let second = process_signed_event(&upserter, &account, &raw, &header, SECRET).await?;
    let after_second = db.fetch_entity("customers", &customer_id).await?;
    let ls_second = db.fetch_entity_last_synced_at("customers", &customer_id).await?;

    assert_eq!(first.event_id, second.event_id);
    assert_eq!(after_first, after_second, "row must be byte-identical");
    assert_eq!(ls_first, ls_second);
    assert_eq!(db.count_entities("customers", &account).await?, 1);
    Ok(())
}

#[tokio::test]
async fn tampered_signature_is_rejected_before_any_write() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("badsig");
    common::seed_account(&db, &account).await?;
    let charge_id = format!("ch_{account}");

    let upserter = EntityUpserter::new(
        db.clone(),
        Arc::new(MockProvider::new()),
        UpsertOptions::default(),
    );

    let (raw, _) = signed(&charge_event("evt_x", &charge_id, 2000, true));
    let ts = chrono::Utc::now().timestamp();
    let forged = format!("t={ts},v1={}", sign_payload("whsec_wrong", ts, &raw));

    let outcome = process_signed_event(&upserter, &account, &raw, &forged, SECRET).await;
    assert!(matches!(outcome, Err(EventError::Signature(_))));
    assert!(db.fetch_entity("charges", &charge_id).await?.is_none());
    Ok(())
}
