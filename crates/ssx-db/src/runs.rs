//! Sync run / object run persistence.
//!
//! State machines:
//!
//! ```text
//! sync run:   (none) --create--> open --all-objects-terminal--> closed
//!             open --cancel-stale--> closed (cancelled)
//!
//! object run: (none) --create--> pending --claim--> running
//!             running --page-progress--> running
//!             running --complete--> complete
//!             running --fail--> error
//!             running --reclaim-stale--> pending
//! ```
//!
//! Claims use a single `FOR UPDATE SKIP LOCKED` statement so no two workers
//! ever hold the same object run, in-process or across processes.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::{advisory_xact_lock, Db, DbError};

/// Identity of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRunKey {
    pub account_id: String,
    /// Unix milliseconds; forms the primary key with the account id.
    pub started_at: i64,
}

impl SyncRunKey {
    /// Advisory-lock name for this run's claim critical section.
    fn lock_name(&self) -> String {
        format!("sync_run:{}:{}", self.account_id, self.started_at)
    }
}

/// One object kind's slice of a run at creation time.
#[derive(Debug, Clone)]
pub struct ObjectSlice {
    pub object_name: String,
    /// Unix seconds; 0 when the slice is unbounded below.
    pub created_gte: i64,
    pub created_lte: Option<i64>,
}

/// A claimed unit of work, handed to one worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub object_name: String,
    pub cursor: Option<i64>,
    pub page_cursor: Option<String>,
    pub created_gte: i64,
    pub created_lte: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRunStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl ObjectRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectRunStatus::Pending => "pending",
            ObjectRunStatus::Running => "running",
            ObjectRunStatus::Complete => "complete",
            ObjectRunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DbError> {
        match s {
            "pending" => Ok(ObjectRunStatus::Pending),
            "running" => Ok(ObjectRunStatus::Running),
            "complete" => Ok(ObjectRunStatus::Complete),
            "error" => Ok(ObjectRunStatus::Error),
            other => Err(DbError::Fatal(format!("invalid object run status: {other}"))),
        }
    }
}

/// Aggregated view of one run; kept consistent with the tables on every
/// read by being computed from them.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunSummary {
    pub account_id: String,
    pub started_at: i64,
    pub trigger_label: String,
    pub closed_at: Option<DateTime<Utc>>,
    /// running | complete | error | partial | cancelled
    pub status: String,
    pub total_objects: i64,
    pub pending: i64,
    pub running: i64,
    pub complete: i64,
    pub error: i64,
    pub processed_count: i64,
}

impl Db {
    // -----------------------------------------------------------------
    // Run creation / lookup
    // -----------------------------------------------------------------

    /// Look up the open run for `(account, trigger)`, if any.
    pub async fn find_open_run(
        &self,
        account_id: &str,
        trigger_label: &str,
    ) -> Result<Option<(SyncRunKey, i32)>, DbError> {
        let row: Option<(i64, i32)> = sqlx::query_as(&format!(
            r#"
            select started_at, max_concurrency
            from {}.sync_runs
            where account_id = $1 and trigger_label = $2 and closed_at is null
            "#,
            self.schema(),
        ))
        .bind(account_id)
        .bind(trigger_label)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(started_at, max_concurrency)| {
            (
                SyncRunKey {
                    account_id: account_id.to_string(),
                    started_at,
                },
                max_concurrency,
            )
        }))
    }

    /// Whether the run is closed. `NotFound` when the run never existed.
    pub async fn run_is_closed(&self, key: &SyncRunKey) -> Result<bool, DbError> {
        let row: Option<(bool,)> = sqlx::query_as(&format!(
            "select closed_at is not null from {}.sync_runs \
             where account_id = $1 and started_at = $2",
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .fetch_optional(self.pool())
        .await?;
        row.map(|(closed,)| closed).ok_or(DbError::NotFound)
    }

    /// Create a run and all of its object runs in one transaction, under
    /// the per-account advisory lock.
    ///
    /// Eager creation of the full object set is load-bearing: progress
    /// accounting sees the complete denominator from the first poll, so the
    /// run cannot close when its first object completes (see
    /// [`Db::close_run_if_done`]).
    pub async fn insert_run_with_objects(
        &self,
        key: &SyncRunKey,
        trigger_label: &str,
        max_concurrency: i32,
        slices: &[ObjectSlice],
    ) -> Result<(), DbError> {
        let mut tx = self.pool().begin().await?;
        advisory_xact_lock(&mut tx, &format!("account:{}", key.account_id)).await?;

        sqlx::query(&format!(
            r#"
            insert into {}.sync_runs (account_id, started_at, trigger_label, max_concurrency)
            values ($1, $2, $3, $4)
            "#,
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .bind(trigger_label)
        .bind(max_concurrency)
        .execute(&mut *tx)
        .await?;

        if !slices.is_empty() {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "insert into {}.object_runs \
                 (account_id, run_started_at, object_name, created_gte, created_lte) ",
                self.schema(),
            ));
            qb.push_values(slices, |mut b, slice| {
                b.push_bind(&key.account_id)
                    .push_bind(key.started_at)
                    .push_bind(&slice.object_name)
                    .push_bind(slice.created_gte)
                    .push_bind(slice.created_lte);
            });
            qb.push(" on conflict do nothing");
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------

    /// Atomically claim the next pending object run, honoring the run's
    /// concurrency cap. Returns `None` when nothing is claimable.
    ///
    /// The cap check and the claim run inside one transaction serialized by
    /// the run's advisory lock; the `FOR UPDATE SKIP LOCKED` claim keeps
    /// cross-process claims exclusive even without the lock.
    pub async fn claim_next_object_run(
        &self,
        key: &SyncRunKey,
        max_concurrency: i32,
    ) -> Result<Option<ClaimedTask>, DbError> {
        let mut tx = self.pool().begin().await?;
        advisory_xact_lock(&mut tx, &key.lock_name()).await?;

        let (running,): (i64,) = sqlx::query_as(&format!(
            r#"
            select count(*)::bigint from {}.object_runs
            where account_id = $1 and run_started_at = $2 and status = 'running'
            "#,
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .fetch_one(&mut *tx)
        .await?;

        if running >= i64::from(max_concurrency) {
            tx.rollback().await?;
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            r#"
            with candidate as (
                select object_name, created_gte
                from {schema}.object_runs
                where account_id = $1 and run_started_at = $2 and status = 'pending'
                order by object_name asc, created_gte asc
                limit 1
                for update skip locked
            )
            update {schema}.object_runs o
               set status = 'running',
                   claimed_at = now(),
                   updated_at = now()
              from candidate c
             where o.account_id = $1
               and o.run_started_at = $2
               and o.object_name = c.object_name
               and o.created_gte = c.created_gte
            returning o.object_name, o.cursor, o.page_cursor, o.created_gte, o.created_lte
            "#,
            schema = self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(ClaimedTask {
            object_name: row.try_get("object_name")?,
            cursor: row.try_get("cursor")?,
            page_cursor: row.try_get("page_cursor")?,
            created_gte: row.try_get("created_gte")?,
            created_lte: row.try_get("created_lte")?,
        }))
    }

    // -----------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------

    /// Record one page of progress on a running object run.
    ///
    /// `cursor` is the oldest `created` seen so far; `page_cursor` is the
    /// last id of the page when more pages remain, or `None` to mark the
    /// slice complete. Progress updates for one slice are serialized by the
    /// claim protocol, so a plain update suffices.
    pub async fn update_object_progress(
        &self,
        key: &SyncRunKey,
        object_name: &str,
        created_gte: i64,
        cursor: Option<i64>,
        page_cursor: Option<String>,
        processed_delta: i64,
        complete: bool,
    ) -> Result<(), DbError> {
        let status = if complete { "complete" } else { "running" };
        sqlx::query(&format!(
            r#"
            update {}.object_runs
               set status = $5,
                   cursor = coalesce($6, cursor),
                   page_cursor = $7,
                   processed_count = processed_count + $8,
                   completed_at = case when $5 = 'complete' then now() else completed_at end,
                   updated_at = now()
             where account_id = $1 and run_started_at = $2
               and object_name = $3 and created_gte = $4
            "#,
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .bind(object_name)
        .bind(created_gte)
        .bind(status)
        .bind(cursor)
        .bind(page_cursor)
        .bind(processed_delta)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Move a running object run back to pending (transient failure; the
    /// claim is relinquished so another worker can retry).
    pub async fn release_object_run(
        &self,
        key: &SyncRunKey,
        object_name: &str,
        created_gte: i64,
    ) -> Result<(), DbError> {
        sqlx::query(&format!(
            r#"
            update {}.object_runs
               set status = 'pending', claimed_at = null, updated_at = now()
             where account_id = $1 and run_started_at = $2
               and object_name = $3 and created_gte = $4
               and status = 'running'
            "#,
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .bind(object_name)
        .bind(created_gte)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Terminal failure for one object run.
    pub async fn fail_object_run(
        &self,
        key: &SyncRunKey,
        object_name: &str,
        created_gte: i64,
        message: &str,
    ) -> Result<(), DbError> {
        sqlx::query(&format!(
            r#"
            update {}.object_runs
               set status = 'error',
                   error_message = $5,
                   completed_at = now(),
                   updated_at = now()
             where account_id = $1 and run_started_at = $2
               and object_name = $3 and created_gte = $4
            "#,
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .bind(object_name)
        .bind(created_gte)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Close / cancel / sweep
    // -----------------------------------------------------------------

    /// Close the run iff every object run is terminal. Returns true when
    /// this call closed it.
    pub async fn close_run_if_done(&self, key: &SyncRunKey) -> Result<bool, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            r#"
            update {schema}.sync_runs r
               set closed_at = now()
             where r.account_id = $1 and r.started_at = $2 and r.closed_at is null
               and not exists (
                   select 1 from {schema}.object_runs o
                   where o.account_id = r.account_id
                     and o.run_started_at = r.started_at
                     and o.status in ('pending', 'running')
               )
            returning r.started_at
            "#,
            schema = self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Operator cancellation: close every open run for the account and mark
    /// its in-flight object runs errored with message "cancelled".
    pub async fn cancel_runs_for_account(&self, account_id: &str) -> Result<u64, DbError> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(&format!(
            r#"
            update {schema}.object_runs o
               set status = 'error', error_message = 'cancelled',
                   completed_at = now(), updated_at = now()
              from {schema}.sync_runs r
             where r.account_id = $1 and r.closed_at is null
               and o.account_id = r.account_id and o.run_started_at = r.started_at
               and o.status in ('pending', 'running')
            "#,
            schema = self.schema(),
        ))
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        let res = sqlx::query(&format!(
            r#"
            update {}.sync_runs
               set closed_at = now(), cancelled = true
             where account_id = $1 and closed_at is null
            "#,
            self.schema(),
        ))
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(res.rows_affected())
    }

    /// Self-cancel runs older than `max_age_secs` (wall clock against the
    /// run's millisecond start stamp). Returns the number of runs closed.
    pub async fn cancel_runs_older_than(&self, max_age_secs: i64) -> Result<u64, DbError> {
        let cutoff_ms = Utc::now().timestamp_millis() - max_age_secs * 1000;
        let mut tx = self.pool().begin().await?;

        sqlx::query(&format!(
            r#"
            update {schema}.object_runs o
               set status = 'error', error_message = 'cancelled',
                   completed_at = now(), updated_at = now()
              from {schema}.sync_runs r
             where r.closed_at is null and r.started_at < $1
               and o.account_id = r.account_id and o.run_started_at = r.started_at
               and o.status in ('pending', 'running')
            "#,
            schema = self.schema(),
        ))
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?;

        let res = sqlx::query(&format!(
            r#"
            update {}.sync_runs
               set closed_at = now(), cancelled = true
             where closed_at is null and started_at < $1
            "#,
            self.schema(),
        ))
        .bind(cutoff_ms)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(res.rows_affected())
    }

    /// Return object runs stuck in `running` (claimed longer than
    /// `stale_secs` ago, e.g. after a worker crash) to `pending`.
    pub async fn reclaim_stale_object_runs(&self, stale_secs: i64) -> Result<u64, DbError> {
        let res = sqlx::query(&format!(
            r#"
            update {}.object_runs
               set status = 'pending', claimed_at = null, updated_at = now()
             where status = 'running'
               and claimed_at < now() - make_interval(secs => $1::double precision)
            "#,
            self.schema(),
        ))
        .bind(stale_secs)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------
    // Summary projection
    // -----------------------------------------------------------------

    /// Per-run counters and derived status, newest first. Computed from the
    /// tables on every read, so it cannot drift from them.
    pub async fn runs_summary(&self, account_id: &str) -> Result<Vec<RunSummary>, DbError> {
        let rows = sqlx::query(&format!(
            r#"
            select r.account_id, r.started_at, r.trigger_label, r.closed_at, r.cancelled,
                   count(o.object_name)::bigint as total_objects,
                   count(*) filter (where o.status = 'pending')::bigint as pending,
                   count(*) filter (where o.status = 'running')::bigint as running,
                   count(*) filter (where o.status = 'complete')::bigint as complete,
                   count(*) filter (where o.status = 'error')::bigint as error,
                   coalesce(sum(o.processed_count), 0)::bigint as processed_count
            from {schema}.sync_runs r
            left join {schema}.object_runs o
              on o.account_id = r.account_id and o.run_started_at = r.started_at
            where r.account_id = $1
            group by r.account_id, r.started_at, r.trigger_label, r.closed_at, r.cancelled
            order by r.started_at desc
            "#,
            schema = self.schema(),
        ))
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cancelled: bool = row.try_get("cancelled")?;
            let pending: i64 = row.try_get("pending")?;
            let running: i64 = row.try_get("running")?;
            let complete: i64 = row.try_get("complete")?;
            let error: i64 = row.try_get("error")?;

            let status = if cancelled {
                "cancelled"
            } else if pending > 0 || running > 0 {
                "running"
            } else if error == 0 {
                "complete"
            } else if complete == 0 {
                "error"
            } else {
                "partial"
            };

            out.push(RunSummary {
                account_id: row.try_get("account_id")?,
                started_at: row.try_get("started_at")?,
                trigger_label: row.try_get("trigger_label")?,
                closed_at: row.try_get("closed_at")?,
                status: status.to_string(),
                total_objects: row.try_get("total_objects")?,
                pending,
                running,
                complete,
                error,
                processed_count: row.try_get("processed_count")?,
            });
        }
        Ok(out)
    }

    /// One object run's `(status, cursor, page_cursor, processed_count)`,
    /// for tests and operator inspection.
    pub async fn fetch_object_run(
        &self,
        key: &SyncRunKey,
        object_name: &str,
        created_gte: i64,
    ) -> Result<Option<(ObjectRunStatus, Option<i64>, Option<String>, i64)>, DbError> {
        let row = sqlx::query(&format!(
            r#"
            select status, cursor, page_cursor, processed_count
            from {}.object_runs
            where account_id = $1 and run_started_at = $2
              and object_name = $3 and created_gte = $4
            "#,
            self.schema(),
        ))
        .bind(&key.account_id)
        .bind(key.started_at)
        .bind(object_name)
        .bind(created_gte)
        .fetch_optional(self.pool())
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status = ObjectRunStatus::parse(&row.try_get::<String, _>("status")?)?;
        Ok(Some((
            status,
            row.try_get("cursor")?,
            row.try_get("page_cursor")?,
            i64::from(row.try_get::<i32, _>("processed_count")?),
        )))
    }

    // -----------------------------------------------------------------
    // Cursor fallback
    // -----------------------------------------------------------------

    /// Last completed cursor for `(account, object)`; the fallback position
    /// store for deployments without run history.
    pub async fn fetch_sync_cursor(
        &self,
        account_id: &str,
        object_name: &str,
    ) -> Result<Option<i64>, DbError> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "select cursor from {}.sync_cursors where account_id = $1 and object_name = $2",
            self.schema(),
        ))
        .bind(account_id)
        .bind(object_name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(c,)| c))
    }

    pub async fn store_sync_cursor(
        &self,
        account_id: &str,
        object_name: &str,
        cursor: i64,
    ) -> Result<(), DbError> {
        sqlx::query(&format!(
            r#"
            insert into {}.sync_cursors (account_id, object_name, cursor)
            values ($1, $2, $3)
            on conflict (account_id, object_name) do update
                set cursor = excluded.cursor, updated_at = now()
            "#,
            self.schema(),
        ))
        .bind(account_id)
        .bind(object_name)
        .bind(cursor)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_run_status_round_trips() {
        for s in [
            ObjectRunStatus::Pending,
            ObjectRunStatus::Running,
            ObjectRunStatus::Complete,
            ObjectRunStatus::Error,
        ] {
            assert_eq!(ObjectRunStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ObjectRunStatus::parse("armed").is_err());
    }
}
