//! Range algebras over a totally ordered key space.
//!
//! A range is a node of an implicit binary hierarchy: the root covers the
//! whole key space, every non-leaf range splits into two disjoint children,
//! and every leaf covers exactly one key. Accumulators and sessions are
//! written once against [`Range`] and instantiated per algebra.

mod linear;
mod prefix;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RangeResult;

pub use linear::LinearRange;
pub use prefix::PrefixRange;

/// Which half of its parent a range occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Split/parent/containment algebra over a key space.
///
/// Implementations must satisfy:
/// - `r.contains(&r)` for every range.
/// - For every non-leaf `r` with `(a, b) = r.split()`: `a != b`, both are
///   contained in `r`, they are disjoint, and `a.parent() == b.parent() == r`.
/// - `Self::root().parent() == Self::root()`.
/// - The derived total order is only used for map indexing; it carries no
///   meaning beyond being consistent with equality.
pub trait Range: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    /// A single point in the key space.
    type Key: Clone + Ord + fmt::Debug + Send + Sync + 'static;

    /// The range covering the entire key space.
    fn root() -> Self;

    /// The singleton range holding exactly `key`.
    fn leaf(key: &Self::Key) -> Self;

    fn is_leaf(&self) -> bool;

    fn is_root(&self) -> bool;

    /// Split into `(left, right)` children.
    ///
    /// Fails with [`RangeError::InvalidOperation`](crate::RangeError) on a
    /// leaf range; callers check [`is_leaf`](Range::is_leaf) first.
    fn split(&self) -> RangeResult<(Self, Self)>;

    /// The enclosing range. The root is its own parent.
    fn parent(&self) -> Self;

    /// Whether `inner` lies entirely within `self`.
    fn contains(&self, inner: &Self) -> bool;

    fn is_left_child(&self) -> bool;

    fn is_right_child(&self) -> bool {
        !self.is_root() && !self.is_left_child()
    }

    /// Number of leaf keys covered, saturating at `u128::MAX` for
    /// unbounded ranges.
    fn size(&self) -> u128;

    /// Check the representation invariants of this range.
    fn validate(&self) -> RangeResult<()>;

    /// Smallest key in the range. The keys of any range form one contiguous
    /// run of the key order starting here.
    fn first_key(&self) -> Self::Key;

    fn contains_key(&self, key: &Self::Key) -> bool {
        self.contains(&Self::leaf(key))
    }

    /// The child of `self` on the path toward `target`.
    ///
    /// `target` must be strictly inside `self`.
    fn child_toward(&self, target: &Self) -> RangeResult<(Side, Self)> {
        let (left, right) = self.split()?;
        if left.contains(target) {
            Ok((Side::Left, left))
        } else {
            Ok((Side::Right, right))
        }
    }

    /// `self`, then each enclosing range up to and including the root.
    fn ancestors(&self) -> Ancestors<Self> {
        Ancestors {
            next: Some(self.clone()),
        }
    }
}

/// Iterator over a range and its enclosing ranges, innermost first.
#[derive(Clone, Debug)]
pub struct Ancestors<R> {
    next: Option<R>,
}

impl<R: Range> Iterator for Ancestors<R> {
    type Item = R;

    fn next(&mut self) -> Option<R> {
        let current = self.next.take()?;
        if !current.is_root() {
            self.next = Some(current.parent());
        }
        Some(current)
    }
}
