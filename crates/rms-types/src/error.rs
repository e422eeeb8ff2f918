use thiserror::Error;

/// Errors produced by range algebra and type operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    /// An algebra operation was applied where it is undefined,
    /// e.g. splitting a leaf range.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("misaligned linear range: start {start:#x} is not a multiple of 2^{depth}")]
    Misaligned { start: u64, depth: u8 },

    #[error("invalid linear depth {0} (max 64)")]
    InvalidDepth(u8),

    #[error("invalid prefix bit count {0}")]
    InvalidBits(u8),

    #[error("non-canonical prefix range: low bits of last byte {byte:#04x} set beyond {bits} bits")]
    NonCanonicalPrefix { byte: u8, bits: u8 },

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Convenience alias for range operations.
pub type RangeResult<T> = Result<T, RangeError>;
