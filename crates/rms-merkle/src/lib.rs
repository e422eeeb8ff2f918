//! Merkle accumulators for range Merkle sync.
//!
//! An accumulator maps ranges of a [`Range`](rms_types::Range) algebra to
//! the hash of all data known inside them, so two peers can compare whole
//! ranges by a single hash.
//!
//! # Implementations
//!
//! All accumulators implement the [`Accumulator`] trait:
//!
//! - [`SparseAccumulator`] -- ordered map from range to hash
//! - [`TreeAccumulator`] -- explicit binary tree in an index arena
//!
//! Both grow their root upward on demand and recompute ancestors bottom-up
//! after every `set`; they return identical hashes for identical inputs.

pub mod sparse;
pub mod traits;
pub mod tree;

pub use sparse::SparseAccumulator;
pub use traits::Accumulator;
pub use tree::TreeAccumulator;
