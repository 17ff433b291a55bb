// =============================================================================
// Error taxonomy — typed failures at the component seams
// =============================================================================
//
// Transient errors are retried locally by the worker that raised them;
// non-transient errors propagate to the caller (query paths) or the health
// counters (ingestion paths). Task edges still use anyhow; these types cover
// the seams where the distinction between retryable and fatal matters.

use thiserror::Error;

/// Failures from the time-series store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient: locked database, busy timeout, I/O hiccup. Retry with
    /// backoff; bucket state is kept in memory.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Non-retryable: schema or constraint violation. The offending rows are
    /// logged and dropped.
    #[error("store rejected write: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(ffi, _) => match ffi.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull => Self::Unavailable(e.to_string()),
                _ => Self::Rejected(e.to_string()),
            },
            _ => Self::Rejected(e.to_string()),
        }
    }
}

/// Failures from the cache tier. Never fatal: callers degrade to direct
/// store reads.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Failures from the upstream history API.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("history API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("history response malformed: {0}")]
    Decode(String),

    #[error("history fetch exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Failures surfaced to query-path clients.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Out-of-range or unrecognised request parameter.
    #[error("{0}")]
    Validation(String),

    /// The store could not serve the request; clients should retry after the
    /// given delay.
    #[error("service unavailable")]
    ServiceUnavailable { retry_after_ms: u64 },
}

impl QueryError {
    /// Machine-readable kind for the structured error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::ServiceUnavailable { .. } => "ServiceUnavailable",
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => Self::ServiceUnavailable {
                retry_after_ms: 1_000,
            },
            StoreError::Rejected(msg) => Self::Validation(msg),
        }
    }
}
