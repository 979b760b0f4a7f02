//! Run registry: orchestration over the gateway's sync-run tables.
//!
//! A sync run is one end-to-end attempt for an account; each object kind
//! (optionally sliced by a created-time window) is an object run, the unit
//! of work claimed by workers.

use chrono::Utc;
use tracing::{info, warn};

use ssx_db::{ClaimedTask, Db, DbError, ObjectSlice, RateLimit, RunSummary, SyncRunKey};
use ssx_stripe::ObjectKind;

/// Runs older than this self-cancel on the next sweep.
pub const DEFAULT_MAX_RUN_AGE_SECS: i64 = 6 * 60 * 60;

/// A running claim older than this is presumed abandoned (crashed worker)
/// and returned to pending.
pub const DEFAULT_STALE_CLAIM_SECS: i64 = 10 * 60;

/// Outcome of one claim attempt.
#[derive(Debug)]
pub enum Claim {
    /// A task was claimed; process one page.
    Task(ClaimedTask),
    /// The global claim throttle is exhausted; back off briefly.
    Throttled,
    /// Nothing pending (or the concurrency cap is reached).
    Empty,
}

/// Join the open run for `(account, trigger)` or create one with an object
/// run per kind.
///
/// Object runs for the whole set are created eagerly with the run, so
/// progress accounting sees the full denominator before the first object
/// completes — otherwise a run with one fast object would close while its
/// siblings were still unstarted.
pub async fn join_or_create_run(
    db: &Db,
    account_id: &str,
    trigger_label: &str,
    objects: &[ObjectKind],
    max_concurrency: i32,
) -> Result<(SyncRunKey, i32), DbError> {
    let slices: Vec<ObjectSlice> = objects
        .iter()
        .map(|kind| ObjectSlice {
            object_name: kind.as_str().to_string(),
            created_gte: 0,
            created_lte: None,
        })
        .collect();
    join_or_create_run_sliced(db, account_id, trigger_label, &slices, max_concurrency).await
}

/// Sliced variant used by time-ranged backfills: one object run per
/// `(object, created window)` pair.
pub async fn join_or_create_run_sliced(
    db: &Db,
    account_id: &str,
    trigger_label: &str,
    slices: &[ObjectSlice],
    max_concurrency: i32,
) -> Result<(SyncRunKey, i32), DbError> {
    if let Some(open) = db.find_open_run(account_id, trigger_label).await? {
        info!(account = account_id, trigger = trigger_label, "joining open sync run");
        return Ok(open);
    }

    let key = SyncRunKey {
        account_id: account_id.to_string(),
        started_at: Utc::now().timestamp_millis(),
    };
    match db
        .insert_run_with_objects(&key, trigger_label, max_concurrency, slices)
        .await
    {
        Ok(()) => {
            info!(
                account = account_id,
                trigger = trigger_label,
                started_at = key.started_at,
                objects = slices.len(),
                "created sync run"
            );
            Ok((key, max_concurrency))
        }
        // Lost the race on the single-open-run index: another process
        // created the run between our lookup and insert. Join theirs.
        Err(DbError::Conflict { .. }) => db
            .find_open_run(account_id, trigger_label)
            .await?
            .ok_or(DbError::NotFound),
        Err(e) => Err(e),
    }
}

/// Build one slice per kind, resuming past the stored fallback cursor.
///
/// First sync: unbounded slice. Re-sync: `created_gte = cursor + 1`, so the
/// run only walks objects newer than what the last completed run reached —
/// backfill advances toward the past, incremental re-runs toward the
/// future.
pub async fn incremental_slices(
    db: &Db,
    account_id: &str,
    objects: &[ObjectKind],
) -> Result<Vec<ObjectSlice>, DbError> {
    let mut slices = Vec::with_capacity(objects.len());
    for kind in objects {
        let created_gte = match db.fetch_sync_cursor(account_id, kind.as_str()).await? {
            Some(cursor) => cursor + 1,
            None => 0,
        };
        slices.push(ObjectSlice {
            object_name: kind.as_str().to_string(),
            created_gte,
            created_lte: None,
        });
    }
    Ok(slices)
}

/// Claim the next pending object run, throttled by the shared claim limit.
pub async fn claim_next_task(
    db: &Db,
    key: &SyncRunKey,
    max_concurrency: i32,
    limit: &RateLimit,
) -> Result<Claim, DbError> {
    if !db.rate_limit_acquire(limit).await? {
        return Ok(Claim::Throttled);
    }
    match db.claim_next_object_run(key, max_concurrency).await? {
        Some(task) => Ok(Claim::Task(task)),
        None => Ok(Claim::Empty),
    }
}

/// Record one page of progress and roll the run up if this completed its
/// last object.
///
/// The cursor advances to the oldest `created` seen; when that crosses the
/// slice's `created_gte` boundary the slice is force-completed (the rest of
/// the range belongs to another slice). Completion also stores the fallback
/// cursor and attempts to close the run.
///
/// Returns true when the object run completed.
#[allow(clippy::too_many_arguments)]
pub async fn update_progress(
    db: &Db,
    key: &SyncRunKey,
    task: &ClaimedTask,
    page_min_created: Option<i64>,
    page_last_id: Option<String>,
    page_len: i64,
    has_more: bool,
) -> Result<bool, DbError> {
    let (cursor, complete) =
        advance_cursor(task.cursor, task.created_gte, page_min_created, has_more);

    db.update_object_progress(
        key,
        &task.object_name,
        task.created_gte,
        cursor,
        if complete { None } else { page_last_id },
        page_len,
        complete,
    )
    .await?;

    if complete {
        if let Some(cursor) = cursor {
            db.store_sync_cursor(&key.account_id, &task.object_name, cursor)
                .await?;
        }
        let closed = db.close_run_if_done(key).await?;
        info!(
            object = %task.object_name,
            created_gte = task.created_gte,
            cursor,
            run_closed = closed,
            "object run complete"
        );
    }
    Ok(complete)
}

/// Terminal failure for one object run, then the close roll-up.
pub async fn fail_object(
    db: &Db,
    key: &SyncRunKey,
    task: &ClaimedTask,
    message: &str,
) -> Result<(), DbError> {
    warn!(object = %task.object_name, message, "object run failed");
    db.fail_object_run(key, &task.object_name, task.created_gte, message)
        .await?;
    db.close_run_if_done(key).await?;
    Ok(())
}

/// Operator cancellation for every open run of an account.
pub async fn cancel(db: &Db, account_id: &str) -> Result<u64, DbError> {
    let cancelled = db.cancel_runs_for_account(account_id).await?;
    if cancelled > 0 {
        info!(account = account_id, cancelled, "cancelled open sync runs");
    }
    Ok(cancelled)
}

/// Periodic sweep: self-cancel ancient runs and return abandoned claims to
/// pending. Called from the worker loop's idle path and at startup.
pub async fn sweep_stale(db: &Db) -> Result<(), DbError> {
    let reclaimed = db.reclaim_stale_object_runs(DEFAULT_STALE_CLAIM_SECS).await?;
    if reclaimed > 0 {
        warn!(reclaimed, "returned stale running object runs to pending");
    }
    let cancelled = db.cancel_runs_older_than(DEFAULT_MAX_RUN_AGE_SECS).await?;
    if cancelled > 0 {
        warn!(cancelled, "self-cancelled sync runs past max age");
    }
    Ok(())
}

/// The per-account summary projection.
pub async fn runs_summary(db: &Db, account_id: &str) -> Result<Vec<RunSummary>, DbError> {
    db.runs_summary(account_id).await
}

/// Cursor/completion arithmetic for one page.
///
/// The cursor only ever moves toward the past (min of old and page
/// minimum). A slice completes when the provider reports no more pages, or
/// when the page reached past the slice's `created_gte` boundary — the
/// remainder of the range belongs to a different slice.
fn advance_cursor(
    task_cursor: Option<i64>,
    created_gte: i64,
    page_min_created: Option<i64>,
    has_more: bool,
) -> (Option<i64>, bool) {
    let cursor = match (task_cursor, page_min_created) {
        (Some(old), Some(new)) => Some(old.min(new)),
        (old, new) => new.or(old),
    };
    let past_boundary = created_gte > 0 && page_min_created.is_some_and(|min| min < created_gte);
    (cursor, !has_more || past_boundary)
}
