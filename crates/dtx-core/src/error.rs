use thiserror::Error;

/// Errors reported by a transactional backend.
///
/// The coordinator never hands these to its callers raw; they are wrapped in
/// edit, submit or rollback errors so the caller can tell whether the system
/// is still consistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Transaction initialization failed: {0}")]
    Initialization(String),

    #[error("Transaction is closed")]
    Closed,

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),
}
