//! Gateway error categories.
//!
//! Raw driver errors never leave this crate; every sqlx failure is folded
//! into one of these categories so callers can decide between retry, skip,
//! and abort without matching on Postgres SQLSTATE codes.

use std::fmt;

#[derive(Debug)]
pub enum DbError {
    /// The requested row does not exist.
    NotFound,
    /// A constraint rejected the write on a path not expected to race.
    Conflict {
        constraint: Option<String>,
        message: String,
        /// True for foreign-key violations (missing parent row), which the
        /// upserter retries after backfilling the parent.
        foreign_key: bool,
    },
    /// Contention or timeout; safe to retry.
    Transient(String),
    /// Unreachable database, broken pool, DDL failure. Abort.
    Fatal(String),
}

impl DbError {
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, DbError::Conflict { foreign_key: true, .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::NotFound => write!(f, "row not found"),
            DbError::Conflict {
                constraint: Some(c),
                message,
                foreign_key,
            } => {
                let kind = if *foreign_key { "foreign key" } else { "unique" };
                write!(f, "{kind} violation on {c}: {message}")
            }
            DbError::Conflict {
                constraint: None,
                message,
                foreign_key,
            } => {
                let kind = if *foreign_key { "foreign key" } else { "unique" };
                write!(f, "{kind} violation: {message}")
            }
            DbError::Transient(msg) => write!(f, "transient db error: {msg}"),
            DbError::Fatal(msg) => write!(f, "fatal db error: {msg}"),
        }
    }
}

impl std::error::Error for DbError {}

/// SQLSTATE classes that indicate contention rather than a broken statement:
/// serialization failure, deadlock, lock timeout, statement timeout,
/// connection failures.
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "55P03", "57014", "08000", "08006"];

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => DbError::NotFound,
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string());
                match code.as_deref() {
                    Some("23505") => DbError::Conflict {
                        constraint: db.constraint().map(str::to_string),
                        message: db.message().to_string(),
                        foreign_key: false,
                    },
                    Some("23503") => DbError::Conflict {
                        constraint: db.constraint().map(str::to_string),
                        message: db.message().to_string(),
                        foreign_key: true,
                    },
                    Some(c) if TRANSIENT_CODES.contains(&c) => {
                        DbError::Transient(db.message().to_string())
                    }
                    _ => DbError::Fatal(db.message().to_string()),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => DbError::Transient(e.to_string()),
            _ => DbError::Fatal(e.to_string()),
        }
    }
}
