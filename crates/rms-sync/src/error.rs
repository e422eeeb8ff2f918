use rms_types::RangeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A peer sent something the session cannot accept. The session should
    /// be dropped: its bisection state is no longer trustworthy.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The data store could not interpret leaf contents.
    #[error("unknown contents: {0}")]
    UnknownContents(String),

    /// Range algebra misuse inside the session; indicates a local bug.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] RangeError),
}

pub type SyncResult<T> = Result<T, SyncError>;
