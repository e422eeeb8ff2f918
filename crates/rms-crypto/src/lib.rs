//! Cryptographic collaborators for range Merkle sync.
//!
//! Provides the pluggable [`MerkleHasher`] consumed by the accumulators
//! (with a domain-separated BLAKE3 implementation), and Ed25519 signing used
//! to authenticate sync frames outside the core protocol.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;
pub mod signer;

pub use hasher::{Blake3Hasher, MerkleHasher};
pub use signer::{KeyGenerator, Signature, SignatureError, SignatureKind, SigningKey, VerifyingKey};
