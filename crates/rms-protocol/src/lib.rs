//! Wire protocol for range Merkle sync.
//!
//! Sessions in `rms-sync` are sans-I/O; this crate puts their messages on a
//! byte stream. It defines the frame format, an optional Ed25519 signature
//! envelope around each frame, and an async [`MessageStream`] with a
//! [`drive`] loop that runs a session against a peer to completion.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod transport;

pub use codec::{Frame, SyncCodec, ENVELOPE_TAG, MAX_FRAME_SIZE};
pub use envelope::{SignedEnvelope, PROTOCOL_VERSION};
pub use error::{ProtocolError, ProtocolResult};
pub use transport::{drive, MessageStream};
