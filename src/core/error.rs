use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Insufficient budget in party {party_id}: required {required}, available {available}")]
    InsufficientBudget {
        party_id: i64,
        required: i64,
        available: i64,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("SQLite error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification handed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InsufficientBudget,
    Conflict,
    Internal,
}

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::InsufficientBudget | ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientBudget => "insufficient_budget",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal",
        }
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::BadRequest(_) => ErrorKind::BadRequest,
            LedgerError::Unauthorized(_) => ErrorKind::Unauthorized,
            LedgerError::Forbidden(_) => ErrorKind::Forbidden,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::InsufficientBudget { .. } => ErrorKind::InsufficientBudget,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::Storage(_)
            | LedgerError::Io(_)
            | LedgerError::Config(_)
            | LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to show to callers. Storage and I/O details stay in the logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }

    /// True for `SQLITE_BUSY` / `SQLITE_LOCKED`, which are safe to retry after rollback.
    pub fn is_busy(&self) -> bool {
        match self {
            LedgerError::Storage(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Maps a UNIQUE constraint violation to `Conflict`, leaving other errors untouched.
    pub fn unique_as_conflict(self, what: &str) -> LedgerError {
        match &self {
            LedgerError::Storage(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::ConstraintViolation
                    && code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                LedgerError::Conflict(format!("{} already exists", what))
            }
            _ => self,
        }
    }
}
