//! Cooperative sync worker.
//!
//! N tokio tasks share the gateway pool; each loops claim → fetch one page
//! → upsert → commit progress. Worker state between suspension points is
//! purely local, so a worker can die at any await without corrupting a run:
//! its claim is swept back to pending and another worker resumes from the
//! committed cursor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use ssx_db::{ClaimedTask, Db, RateLimit, SyncRunKey};
use ssx_stripe::{ListParams, ObjectKind, ProviderLister, DEFAULT_PAGE_SIZE};

use crate::runs::{self, Claim};
use crate::upserter::EntityUpserter;

/// Backoff after an unexpected (transient) failure inside a worker.
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff when the shared claim throttle is exhausted.
const THROTTLE_BACKOFF: Duration = Duration::from_millis(200);
/// Idle poll interval while other workers drain the run.
const IDLE_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cooperative workers to spawn. Capped by the run's concurrency limit.
    pub workers: usize,
    pub page_size: i64,
    /// Stop after claiming this many tasks (operators use it to smoke-test
    /// a backfill); `None` runs to completion.
    pub task_budget: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size: DEFAULT_PAGE_SIZE,
            task_budget: None,
        }
    }
}

/// Drive one sync run to completion (or budget / shutdown).
///
/// Returns when the run is closed or every worker has exited. In-flight
/// claims left behind by a shutdown stay `running` and are returned to
/// `pending` by the stale sweep on the next start.
pub async fn run_sync_workers<L>(
    db: Db,
    upserter: Arc<EntityUpserter<L>>,
    key: SyncRunKey,
    max_concurrency: i32,
    cfg: WorkerConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<()>
where
    L: ProviderLister + 'static,
{
    // Recover claims abandoned by a previous process before claiming anew.
    runs::sweep_stale(&db).await.context("stale sweep failed")?;

    let worker_count = cfg.workers.min(max_concurrency.max(1) as usize).max(1);
    let claimed = Arc::new(AtomicUsize::new(0));
    let mut set = JoinSet::new();

    info!(
        account = %key.account_id,
        started_at = key.started_at,
        workers = worker_count,
        "sync workers starting"
    );

    for worker_id in 0..worker_count {
        let db = db.clone();
        let upserter = Arc::clone(&upserter);
        let key = key.clone();
        let cfg = cfg.clone();
        let shutdown = Arc::clone(&shutdown);
        let claimed = Arc::clone(&claimed);
        set.spawn(async move {
            worker_loop(
                worker_id,
                db,
                upserter,
                key,
                max_concurrency,
                cfg,
                shutdown,
                claimed,
            )
            .await;
        });
    }

    while let Some(joined) = set.join_next().await {
        joined.context("sync worker panicked")?;
    }

    info!(
        account = %key.account_id,
        tasks = claimed.load(Ordering::Relaxed),
        "sync workers drained"
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<L: ProviderLister>(
    worker_id: usize,
    db: Db,
    upserter: Arc<EntityUpserter<L>>,
    key: SyncRunKey,
    max_concurrency: i32,
    cfg: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    claimed: Arc<AtomicUsize>,
) {
    let limit = RateLimit::task_claims();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!(worker_id, "shutdown flag set, worker exiting");
            return;
        }
        if let Some(budget) = cfg.task_budget {
            if claimed.load(Ordering::Relaxed) >= budget {
                info!(worker_id, budget, "task budget reached, worker exiting");
                return;
            }
        }

        match runs::claim_next_task(&db, &key, max_concurrency, &limit).await {
            Ok(Claim::Task(task)) => {
                claimed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = process_task(&db, &upserter, &key, &task, &cfg).await {
                    // Transient by policy: relinquish the claim, back off,
                    // keep the worker alive. Permanent failures were already
                    // recorded inside process_task.
                    error!(worker_id, object = %task.object_name, error = %e, "task failed, releasing claim");
                    if let Err(re) = db
                        .release_object_run(&key, &task.object_name, task.created_gte)
                        .await
                    {
                        error!(worker_id, error = %re, "claim release failed");
                    }
                    sleep(TRANSIENT_BACKOFF).await;
                }
            }
            Ok(Claim::Throttled) => sleep(THROTTLE_BACKOFF).await,
            Ok(Claim::Empty) => {
                // Nothing claimable: either the run is done, or siblings
                // hold the remaining work. Attempt the roll-up ourselves
                // (idempotent; also covers a sibling that died between its
                // last object and the close), then exit or poll.
                let closed = match db.close_run_if_done(&key).await {
                    Ok(true) => Ok(true),
                    Ok(false) => db.run_is_closed(&key).await,
                    Err(e) => Err(e),
                };
                match closed {
                    Ok(true) => return,
                    Ok(false) => sleep(IDLE_POLL).await,
                    Err(e) => {
                        error!(worker_id, error = %e, "run status probe failed");
                        sleep(TRANSIENT_BACKOFF).await;
                    }
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "claim failed");
                sleep(TRANSIENT_BACKOFF).await;
            }
        }
    }
}

/// One claimed task: fetch one page, upsert it, commit progress.
async fn process_task<L: ProviderLister>(
    db: &Db,
    upserter: &EntityUpserter<L>,
    key: &SyncRunKey,
    task: &ClaimedTask,
    cfg: &WorkerConfig,
) -> Result<()> {
    let Some(kind) = ObjectKind::parse(&task.object_name) else {
        runs::fail_object(db, key, task, "unknown object kind").await?;
        return Ok(());
    };

    let params = ListParams {
        limit: Some(cfg.page_size),
        starting_after: task.page_cursor.clone(),
        // The cursor is the upper bound: backfill walks toward the past.
        created_lte: kind
            .supports_created_filter()
            .then_some(task.cursor.or(task.created_lte))
            .flatten(),
        created_gte: (kind.supports_created_filter() && task.created_gte > 0)
            .then_some(task.created_gte),
    };

    let page = match upserter.lister().list_page(kind, &params).await {
        Ok(page) => page,
        Err(e) if !e.is_retryable() => {
            runs::fail_object(db, key, task, &format!("provider error: {e}")).await?;
            return Ok(());
        }
        Err(e) => return Err(e).context("list page fetch failed"),
    };

    // An empty page claiming more data would loop forever; refuse to spin
    // on an upstream contract violation.
    if page.data.is_empty() && page.has_more {
        runs::fail_object(db, key, task, "provider returned has_more with empty page").await?;
        return Ok(());
    }

    if page.data.is_empty() {
        runs::update_progress(db, key, task, None, None, 0, false).await?;
        return Ok(());
    }

    let stats = upserter
        .upsert(&page.data, &key.account_id, Utc::now().timestamp_millis())
        .await
        .context("page upsert failed")?;

    if !stats.errors.is_empty() {
        warn!(
            object = %task.object_name,
            errored = stats.errors.len(),
            "rows failed within page"
        );
        if stats.written() == 0 && stats.skipped_older == 0 {
            let msg = format!("all {} rows in page failed", stats.errors.len());
            runs::fail_object(db, key, task, &msg).await?;
            return Ok(());
        }
    }

    let page_min_created = page
        .data
        .iter()
        .filter_map(|doc| doc.get("created").and_then(Value::as_i64))
        .min();
    let page_last_id = page
        .data
        .last()
        .and_then(|doc| doc.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    runs::update_progress(
        db,
        key,
        task,
        page_min_created,
        page_last_id,
        page.data.len() as i64,
        page.has_more,
    )
    .await?;
    Ok(())
}
