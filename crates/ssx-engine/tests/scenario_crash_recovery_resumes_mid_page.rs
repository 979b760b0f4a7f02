//! Crash recovery: a backfill interrupted mid-run resumes from the
//! committed cursor/page-cursor and still mirrors everything exactly once.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::json;

use ssx_db::ObjectRunStatus;
use ssx_engine::{runs, EntityUpserter, UpsertOptions, WorkerConfig};
use ssx_stripe::ObjectKind;

use common::MockProvider;

#[tokio::test]
async fn interrupted_backfill_resumes_and_completes() -> anyhow::Result<()> {
    let Some(db) = common::test_db().await? else { return Ok(()) };
    let account = common::unique_account("recover");
    common::seed_account(&db, &account).await?;

    // 200 products across two pages of 100.
    let provider = Arc::new(MockProvider::new());
    provider.seed(
        ObjectKind::Product,
        (1..=200)
            .map(|n| {
                json!({
                    "id": format!("prod_{n:03}_{account}"),
                    "object": "product",
                    "created": n
                })
            })
            .collect(),
    );
    let upserter = Arc::new(EntityUpserter::new(
        db.clone(),
        Arc::clone(&provider),
        UpsertOptions::default(),
    ));

    let (key, cap) = runs::join_or_create_run(
        &db,
        &account,
        "cli-backfill",
        &[ObjectKind::Product],
        1,
    )
    .await?;

    // "Crash" after one page: a task budget of one claim stops the worker
    // with the object run still running and a page cursor committed.
    ssx_engine::run_sync_workers(
        db.clone(),
        Arc::clone(&upserter),
        key.clone(),
        cap,
        WorkerConfig {
            workers: 1,
            page_size: 100,
            task_budget: Some(1),
        },
        Arc::new(AtomicBool::new(false)),
    )
    .await?;

    let mirrored = db.count_entities("products", &account).await?;
    assert!(mirrored > 0 && mirrored < 200, "one page landed, got {mirrored}");
    let (status, cursor, page_cursor, _) = db
        .fetch_object_run(&key, "product", 0)
        .await?
        .expect("object run exists");
    assert_eq!(status, ObjectRunStatus::Running);
    assert!(cursor.is_some());
    assert!(page_cursor.is_some(), "mid-page continuation committed");
    assert!(!db.run_is_closed(&key).await?);

    // Restart: the abandoned claim goes back to pending, then a fresh
    // worker drains the run.
    db.release_object_run(&key, "product", 0).await?;
    ssx_engine::run_sync_workers(
        db.clone(),
        upserter,
        key.clone(),
        cap,
        WorkerConfig {
            workers: 1,
            page_size: 100,
            task_budget: None,
        },
        Arc::new(AtomicBool::new(false)),
    )
    .await?;

    assert_eq!(db.count_entities("products", &account).await?, 200);
    let (status, cursor, page_cursor, processed) = db
        .fetch_object_run(&key, "product", 0)
        .await?
        .expect("object run exists");
    assert_eq!(status, ObjectRunStatus::Complete);
    assert_eq!(cursor, Some(1));
    assert_eq!(page_cursor, None);
    assert_eq!(processed, 200, "every row processed exactly once");
    assert!(db.run_is_closed(&key).await?);
    Ok(())
}
