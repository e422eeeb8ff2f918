use rms_crypto::SignatureError;
use rms_sync::SyncError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("frame tagged {header} carries a message tagged {payload}")]
    TagMismatch { header: u8, payload: u8 },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("frame signed by an unexpected key")]
    UnexpectedSigner,

    #[error("unsigned frame on an authenticated stream")]
    Unsigned,

    #[error("peer closed the stream before synchronization completed")]
    Incomplete,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
