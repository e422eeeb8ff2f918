//! Foundation types for range Merkle sync (RMS).
//!
//! This crate provides the value types shared by every other RMS crate: the
//! fixed-size [`Hash`] produced by a pluggable hash function, and the
//! [`Range`] capability implemented by the two range algebras that the
//! accumulators and the synchronization session are generic over.
//!
//! # Key Types
//!
//! - [`Hash`]: 32-byte digest; the all-zero value means "no data here"
//! - [`Range`]: split/parent/containment algebra over a key space
//! - [`LinearRange`]: power-of-two aligned ranges over `u64` keys
//! - [`PrefixRange`]: binary-prefix ranges over byte-string keys

pub mod error;
pub mod hash;
pub mod range;

pub use error::{RangeError, RangeResult};
pub use hash::Hash;
pub use range::{Ancestors, LinearRange, PrefixRange, Range, Side};
