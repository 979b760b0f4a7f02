//! Database-backed claim throttle.
//!
//! A windowed counter row per limiter name, mutated only inside an
//! advisory-locked transaction so concurrent processes agree on the count.
//! A denied acquire rolls the transaction back, leaving the counter
//! untouched.

use crate::{advisory_xact_lock, Db, DbError};

/// Named limiter: at most `max` acquisitions per `window_secs`.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub name: String,
    pub max: i32,
    pub window_secs: i64,
}

impl RateLimit {
    /// The default throttle for object-run claims: 50 claims/sec shared by
    /// every worker on the database.
    pub fn task_claims() -> Self {
        Self {
            name: "task_claims".to_string(),
            max: 50,
            window_secs: 1,
        }
    }
}

impl Db {
    /// Try to take one slot. Returns false when the window is exhausted.
    pub async fn rate_limit_acquire(&self, limit: &RateLimit) -> Result<bool, DbError> {
        let mut tx = self.pool().begin().await?;
        advisory_xact_lock(&mut tx, &format!("rate_limit:{}", limit.name)).await?;

        let (count,): (i32,) = sqlx::query_as(&format!(
            r#"
            insert into {schema}.rate_limits as rl (name, window_start, count)
            values ($1, now(), 1)
            on conflict (name) do update set
                count = case
                    when now() - rl.window_start > make_interval(secs => $2::double precision)
                        then 1
                    else rl.count + 1
                end,
                window_start = case
                    when now() - rl.window_start > make_interval(secs => $2::double precision)
                        then now()
                    else rl.window_start
                end
            returning rl.count
            "#,
            schema = self.schema(),
        ))
        .bind(&limit.name)
        .bind(limit.window_secs)
        .fetch_one(&mut *tx)
        .await?;

        if count > limit.max {
            tx.rollback().await?;
            Ok(false)
        } else {
            tx.commit().await?;
            Ok(true)
        }
    }
}
