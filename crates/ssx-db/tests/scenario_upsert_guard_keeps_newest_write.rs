//! Last-writer-wins: an older write never overwrites a newer row, and
//! replaying the same write is a no-op.

mod common;

use serde_json::json;
use ssx_db::{EntityRow, UpsertOutcome};

fn charge_row(account: &str, id: &str, last_synced_at: i64, paid: bool) -> EntityRow {
    EntityRow {
        id: id.to_string(),
        account_id: account.to_string(),
        object: json!({"id": id, "object": "charge", "paid": paid}),
        last_synced_at,
        deleted: false,
    }
}

#[tokio::test]
async fn older_write_is_skipped_and_newer_data_survives() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("guard");
    common::seed_account(&db, &account).await?;
    let charge_id = format!("ch_{account}");

    // Newer event first.
    let outcomes = db
        .upsert_entity_rows("charges", false, &[charge_row(&account, &charge_id, 2_000_000, true)])
        .await?;
    assert_eq!(outcomes, vec![UpsertOutcome::Inserted]);

    // Out-of-order older event: guard rejects, reported as skipped.
    let outcomes = db
        .upsert_entity_rows("charges", false, &[charge_row(&account, &charge_id, 1_940_000, false)])
        .await?;
    assert_eq!(outcomes, vec![UpsertOutcome::SkippedOlder]);

    let doc = db.fetch_entity("charges", &charge_id).await?.expect("row exists");
    assert_eq!(doc["paid"], true, "older write must not regress the row");
    assert_eq!(
        db.fetch_entity_last_synced_at("charges", &charge_id).await?,
        Some(2_000_000)
    );

    // Replaying the newest write is idempotent: guard passes on equality,
    // data is unchanged.
    let outcomes = db
        .upsert_entity_rows("charges", false, &[charge_row(&account, &charge_id, 2_000_000, true)])
        .await?;
    assert_eq!(outcomes, vec![UpsertOutcome::Updated]);
    let replayed = db.fetch_entity("charges", &charge_id).await?.expect("row exists");
    assert_eq!(replayed, doc);

    Ok(())
}

#[tokio::test]
async fn batch_reports_mixed_outcomes_in_input_order() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("batch");
    common::seed_account(&db, &account).await?;
    let existing = format!("ch_a_{account}");
    let fresh = format!("ch_b_{account}");

    db.upsert_entity_rows("charges", false, &[charge_row(&account, &existing, 5_000, true)])
        .await?;

    let outcomes = db
        .upsert_entity_rows(
            "charges",
            false,
            &[
                charge_row(&account, &existing, 1_000, false), // older → skipped
                charge_row(&account, &fresh, 1_000, false),    // new → inserted
            ],
        )
        .await?;
    assert_eq!(
        outcomes,
        vec![UpsertOutcome::SkippedOlder, UpsertOutcome::Inserted]
    );

    assert_eq!(db.count_entities("charges", &account).await?, 2);
    Ok(())
}

#[tokio::test]
async fn soft_delete_flags_without_removing() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("softdel");
    common::seed_account(&db, &account).await?;
    let customer_id = format!("cus_{account}");

    let row = EntityRow {
        id: customer_id.clone(),
        account_id: account.clone(),
        object: json!({"id": customer_id, "object": "customer"}),
        last_synced_at: 1_000,
        deleted: false,
    };
    db.upsert_entity_rows("customers", true, &[row]).await?;

    assert!(db.soft_delete_entity("customers", &customer_id).await?);
    // Row still present, raw document untouched.
    let doc = db.fetch_entity("customers", &customer_id).await?;
    assert!(doc.is_some());

    // Unknown id: nothing to flag.
    assert!(!db.soft_delete_entity("customers", "cus_never_seen").await?);
    Ok(())
}
