use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A value read inside a transaction changed before commit.
    #[error("transaction conflict: {0} changed before commit")]
    Conflict(String),

    /// SQLite reported the database busy or locked.
    #[error("database busy")]
    Busy,

    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    /// A stored row could not be mapped back to a model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Failures worth retrying: the same call may succeed a moment later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Busy)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Self::Busy
            }
            _ => Self::Sqlite(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
