use rms_types::{Hash, Range, RangeResult};

/// Merkle accumulator over a range algebra.
///
/// All implementations must satisfy these invariants:
/// - For every stored non-leaf range `r`,
///   `get(r) == H(get(left(r)), get(right(r)))`, where a child holding no
///   data contributes [`Hash::ZERO`].
/// - Every ancestor of a key passed to `set`, up to the current root, is
///   stored. Ranges inside the root that are not stored hold no data.
/// - The root is the smallest range containing every key set so far; it
///   only ever grows.
/// - The accumulator owns all of its nodes; nothing is shared.
pub trait Accumulator: Send {
    type Range: Range;

    /// Accumulated hash of `range`.
    ///
    /// Returns the stored hash when `range` is stored, the root hash when
    /// `range` contains the root, and [`Hash::ZERO`] otherwise.
    fn get(&self, range: &Self::Range) -> Hash;

    /// Set the hash of the singleton range for `key` and recompute every
    /// ancestor up to the root, growing the root first if `key` lies
    /// outside it.
    fn set(&mut self, key: &<Self::Range as Range>::Key, hash: Hash) -> RangeResult<()>;

    /// The current root range, or `None` while empty.
    fn root(&self) -> Option<Self::Range>;

    /// Hash of the whole key space.
    fn root_hash(&self) -> Hash {
        self.get(&Self::Range::root())
    }

    /// Number of stored ranges.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.root().is_none()
    }

    /// Every stored range, in ascending order.
    fn ranges(&self) -> Vec<Self::Range>;
}
