use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),

    /// The task already holds a slot.
    #[error("task {0} already holds a slot")]
    AlreadyActive(String),

    /// Another `acquire` for the same task is pending in this process.
    #[error("task {0} is already waiting for a slot")]
    AlreadyWaiting(String),

    #[error("acquire cancelled")]
    Cancelled,

    #[error("timed out waiting for a slot")]
    TimedOut,

    /// The controller was shut down while waiting.
    #[error("admission controller closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}
