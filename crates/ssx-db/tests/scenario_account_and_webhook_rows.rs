//! Account rows (key-hash registration, dangerous delete) and managed
//! webhook row uniqueness.

mod common;

use serde_json::json;
use ssx_db::{DbError, EntityRow};

#[tokio::test]
async fn account_registers_key_hashes_without_duplicates() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("keys");
    let doc = json!({"id": account, "object": "account", "country": "US"});

    db.upsert_account(&account, &doc, "hash_one").await?;
    db.upsert_account(&account, &doc, "hash_one").await?;
    db.upsert_account(&account, &doc, "hash_two").await?;

    let row = db.fetch_account(&account).await?.expect("account exists");
    assert_eq!(row.api_key_hashes, vec!["hash_one", "hash_two"]);

    assert_eq!(
        db.find_account_by_key_hash("hash_two").await?,
        Some(account.clone())
    );
    assert_eq!(db.find_account_by_key_hash("hash_unknown").await?, None);

    // Document id must match the declared account id.
    let mismatched = db
        .upsert_account(&account, &json!({"id": "acct_other"}), "h")
        .await;
    assert!(mismatched.is_err());
    Ok(())
}

#[tokio::test]
async fn dangerous_delete_reports_counts_and_warnings() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("nuke");
    common::seed_account(&db, &account).await?;

    let charge = format!("ch_{account}");
    db.upsert_entity_rows(
        "charges",
        false,
        &[EntityRow {
            id: charge.clone(),
            account_id: account.clone(),
            object: json!({"id": charge, "object": "charge"}),
            last_synced_at: 1,
            deleted: false,
        }],
    )
    .await?;
    db.insert_run_with_objects(
        &ssx_db::SyncRunKey {
            account_id: account.clone(),
            started_at: chrono::Utc::now().timestamp_millis(),
        },
        "worker",
        4,
        &[],
    )
    .await?;

    let report = db
        .dangerously_delete_account_data(&account, &["charges", "customers"])
        .await?;

    assert_eq!(report.deleted_account_id, account);
    let charges = report
        .deleted_record_counts
        .iter()
        .find(|(t, _)| t == "charges")
        .expect("charges counted");
    assert_eq!(charges.1, 1);
    assert!(
        report.warnings.iter().any(|w| w.contains("open sync run")),
        "open run must be surfaced: {:?}",
        report.warnings
    );

    assert!(db.fetch_account(&account).await?.is_none());
    assert!(db.fetch_entity("charges", &charge).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn webhook_rows_unique_per_account_and_url() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("hooks");
    common::seed_account(&db, &account).await?;
    let url = format!("https://{account}.example/webhooks");

    let we_id = format!("we_{account}");
    db.insert_managed_webhook(&we_id, &url, "whsec_1", &account).await?;

    let dup = db
        .insert_managed_webhook(&format!("we2_{account}"), &url, "whsec_2", &account)
        .await;
    assert!(matches!(dup, Err(DbError::Conflict { .. })));

    let row = db
        .find_managed_webhook(&account, &url)
        .await?
        .expect("row exists");
    assert_eq!(row.id, we_id);
    assert_eq!(row.secret, "whsec_1");

    assert!(db.delete_managed_webhook_row(&we_id).await?);
    assert!(!db.delete_managed_webhook_row(&we_id).await?, "idempotent");
    Ok(())
}

#[tokio::test]
async fn rate_limit_window_denies_over_budget() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };

    // Unique limiter name per test execution; long window so the test
    // cannot flake on timing.
    let limit = ssx_db::RateLimit {
        name: common::unique_account("limit"),
        max: 2,
        window_secs: 3600,
    };

    assert!(db.rate_limit_acquire(&limit).await?);
    assert!(db.rate_limit_acquire(&limit).await?);
    assert!(!db.rate_limit_acquire(&limit).await?);
    // A denied acquire does not consume the window.
    assert!(!db.rate_limit_acquire(&limit).await?);
    Ok(())
}
