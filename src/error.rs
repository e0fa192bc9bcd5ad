use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DdlError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Transaction conflict, retry later")]
    TxnConflict,

    #[error("Entry too large: {size} bytes exceeds limit {limit}")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("Invalid DDL job: {0}")]
    InvalidJob(String),

    #[error("Cancelled DDL job: {0}")]
    CancelledJob(String),

    #[error("DDL job {0} cannot be cancelled: {1}")]
    CannotCancel(i64, String),

    #[error("Invalid job version {job}, current version {current}")]
    InvalidJobVersion { job: i64, current: i64 },

    #[error("Timeout waiting for reorganization to finish")]
    WaitReorgTimeout,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Scheduler is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DdlError {
    /// Store errors that abort the current transaction without touching job state.
    pub fn is_transient(&self) -> bool {
        matches!(self, DdlError::TxnConflict)
    }

    pub fn is_entry_too_large(&self) -> bool {
        matches!(self, DdlError::EntryTooLarge { .. })
    }
}

impl From<serde_json::Error> for DdlError {
    fn from(e: serde_json::Error) -> Self {
        DdlError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DdlError>;
