//! Set reconciliation between two peers by Merkle range bisection.
//!
//! Each peer wraps its local [`Dataset`] in a session and exchanges
//! [`Message`]s with the other side. Sessions compare range hashes, split
//! ranges that differ, and stream the leaves of ranges one side lacks
//! entirely. Sessions are sans-I/O: every operation takes an emit callback
//! and the caller moves emitted messages to the peer in order.
//!
//! # Layers
//!
//! - [`SyncSession`] -- core bisection with hierarchical acknowledgements
//! - [`Dedup`] -- keeps each key from crossing the wire more than once
//! - [`Tracked`] -- reports when the exchange has finished
//!
//! All three implement [`Session`], so the usual stack is
//! `Tracked<Dedup<SyncSession<D>>>`.
//!
//! # Example
//!
//! ```
//! use rms_merkle::SparseAccumulator;
//! use rms_sync::{Dataset, Dedup, MemoryStore, Record, Replica, Session, SessionConfig, SyncSession, Tracked};
//! use rms_types::LinearRange;
//!
//! let mut a = Replica::new(SparseAccumulator::<LinearRange>::new(), MemoryStore::new());
//! a.insert(Record::new(1, b"one".to_vec())).unwrap();
//! let b = Replica::new(SparseAccumulator::<LinearRange>::new(), MemoryStore::new());
//!
//! let mut a = Tracked::new(Dedup::new(SyncSession::new(a, SessionConfig::initiator()), true), || {});
//! let mut b = Tracked::new(Dedup::new(SyncSession::new(b, SessionConfig::responder()), false), || {});
//!
//! let (mut to_a, mut to_b) = (Vec::new(), Vec::new());
//! a.start(&mut |m| to_b.push(m)).unwrap();
//! b.start(&mut |m| to_a.push(m)).unwrap();
//! while !(to_a.is_empty() && to_b.is_empty()) {
//!     for m in std::mem::take(&mut to_b) {
//!         b.recv(m, &mut |m| to_a.push(m)).unwrap();
//!     }
//!     for m in std::mem::take(&mut to_a) {
//!         a.recv(m, &mut |m| to_b.push(m)).unwrap();
//!     }
//! }
//! assert!(a.is_complete() && b.is_complete());
//! ```

pub mod config;
pub mod dataset;
pub mod dedup;
pub mod error;
pub mod message;
pub mod session;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SessionConfig;
pub use dataset::{Dataset, LeafStore, MemoryStore, MergePolicy, Record, Replica};
pub use dedup::Dedup;
pub use error::{SyncError, SyncResult};
pub use message::Message;
pub use session::{Emit, Session, SessionMessage, SessionState, SessionStats, SyncSession};
pub use tracker::Tracked;
