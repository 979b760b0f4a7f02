//! Claim exclusivity: concurrent claimants never receive the same object
//! run, and the concurrency cap bounds simultaneous running claims.

mod common;

use ssx_db::{ObjectSlice, SyncRunKey};

fn slice(name: &str) -> ObjectSlice {
    ObjectSlice {
        object_name: name.to_string(),
        created_gte: 0,
        created_lte: None,
    }
}

#[tokio::test]
async fn concurrent_claims_are_exclusive() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("claim");
    common::seed_account(&db, &account).await?;

    let key = SyncRunKey {
        account_id: account.clone(),
        started_at: chrono::Utc::now().timestamp_millis(),
    };
    db.insert_run_with_objects(&key, "test", 4, &[slice("product")])
        .await?;

    // Race two claimants for a single pending object run.
    let (a, b) = tokio::join!(
        db.claim_next_object_run(&key, 4),
        db.claim_next_object_run(&key, 4),
    );
    let claims = [a?, b?];
    let won = claims.iter().filter(|c| c.is_some()).count();
    assert_eq!(won, 1, "exactly one claimant may hold the object run");

    Ok(())
}

#[tokio::test]
async fn concurrency_cap_blocks_further_claims() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("cap");
    common::seed_account(&db, &account).await?;

    let key = SyncRunKey {
        account_id: account.clone(),
        started_at: chrono::Utc::now().timestamp_millis(),
    };
    db.insert_run_with_objects(&key, "test", 1, &[slice("product"), slice("charge")])
        .await?;

    let first = db.claim_next_object_run(&key, 1).await?;
    assert!(first.is_some());

    // Cap of 1 with one claim outstanding: nothing more to hand out, even
    // though a pending object run exists.
    let second = db.claim_next_object_run(&key, 1).await?;
    assert!(second.is_none(), "cap must block the second claim");

    Ok(())
}

#[tokio::test]
async fn stale_running_claims_return_to_pending() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("stale");
    common::seed_account(&db, &account).await?;

    let key = SyncRunKey {
        account_id: account.clone(),
        started_at: chrono::Utc::now().timestamp_millis(),
    };
    db.insert_run_with_objects(&key, "test", 4, &[slice("product")])
        .await?;
    let task = db.claim_next_object_run(&key, 4).await?.expect("claimed");

    // Simulate a crashed worker: age the claim past the threshold.
    sqlx::query(&format!(
        "update {}.object_runs set claimed_at = now() - interval '1 hour' \
         where account_id = $1 and run_started_at = $2",
        db.schema(),
    ))
    .bind(&account)
    .bind(key.started_at)
    .execute(db.pool())
    .await?;

    let reclaimed = db.reclaim_stale_object_runs(600).await?;
    assert!(reclaimed >= 1);

    let (status, ..) = db
        .fetch_object_run(&key, &task.object_name, task.created_gte)
        .await?
        .expect("object run exists");
    assert_eq!(status, ssx_db::ObjectRunStatus::Pending);

    // And it is claimable again.
    assert!(db.claim_next_object_run(&key, 4).await?.is_some());
    Ok(())
}
