//! Persistence for identities and posts.
//!
//! Functions take a borrowed connection so handlers decide pool checkout and
//! transaction scope. Read-modify-write sequences on a single post (like,
//! share, comment) are not guarded against interleaving beyond what SQLite's
//! per-statement atomicity gives; a multi-process deployment would want
//! optimistic version checks here.

pub mod posts;
pub mod users;

use chrono::{SecondsFormat, Utc};
use rusqlite::ErrorCode;

use crate::error::AppError;

/// Current time as a sortable RFC 3339 UTC string.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// A write referencing the acting identity failed its foreign key: the
/// token outlived its account.
pub(crate) fn identity_gone(err: rusqlite::Error) -> AppError {
    if is_constraint_violation(&err) {
        AppError::Unauthenticated("User not found".into())
    } else {
        err.into()
    }
}
