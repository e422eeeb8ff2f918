use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RangeError, RangeResult};
use crate::range::Range;

/// Depth of the root range: the whole `u64` key space.
const ROOT_DEPTH: u8 = 64;

/// A power-of-two aligned range of `u64` keys: `[start, start + 2^depth)`.
///
/// `start` always has at least `depth` trailing zero bits. Suited to
/// append-only sequences where keys are sequence numbers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawLinearRange")]
pub struct LinearRange {
    start: u64,
    depth: u8,
}

#[derive(Deserialize)]
struct RawLinearRange {
    start: u64,
    depth: u8,
}

impl TryFrom<RawLinearRange> for LinearRange {
    type Error = RangeError;

    fn try_from(raw: RawLinearRange) -> RangeResult<Self> {
        Self::new(raw.start, raw.depth)
    }
}

/// Mask of the low `depth` bits.
fn low_mask(depth: u8) -> u64 {
    if depth >= ROOT_DEPTH {
        u64::MAX
    } else {
        (1u64 << depth) - 1
    }
}

impl LinearRange {
    /// Build a range, enforcing the alignment invariant.
    pub fn new(start: u64, depth: u8) -> RangeResult<Self> {
        if depth > ROOT_DEPTH {
            return Err(RangeError::InvalidDepth(depth));
        }
        if start & low_mask(depth) != 0 {
            return Err(RangeError::Misaligned { start, depth });
        }
        Ok(Self { start, depth })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The last key covered (inclusive).
    pub fn last(&self) -> u64 {
        self.start | low_mask(self.depth)
    }
}

impl Range for LinearRange {
    type Key = u64;

    fn root() -> Self {
        Self {
            start: 0,
            depth: ROOT_DEPTH,
        }
    }

    fn leaf(key: &u64) -> Self {
        Self {
            start: *key,
            depth: 0,
        }
    }

    fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    fn is_root(&self) -> bool {
        self.depth == ROOT_DEPTH
    }

    fn split(&self) -> RangeResult<(Self, Self)> {
        if self.is_leaf() {
            return Err(RangeError::InvalidOperation(format!(
                "cannot split leaf range {self:?}"
            )));
        }
        let depth = self.depth - 1;
        let left = Self {
            start: self.start,
            depth,
        };
        let right = Self {
            start: self.start | (1u64 << depth),
            depth,
        };
        Ok((left, right))
    }

    fn parent(&self) -> Self {
        if self.is_root() {
            return *self;
        }
        let depth = self.depth + 1;
        Self {
            start: self.start & !low_mask(depth),
            depth,
        }
    }

    fn contains(&self, inner: &Self) -> bool {
        self.depth >= inner.depth && inner.start & !low_mask(self.depth) == self.start
    }

    fn is_left_child(&self) -> bool {
        !self.is_root() && self.start & (1u64 << self.depth) == 0
    }

    fn first_key(&self) -> u64 {
        self.start
    }

    fn size(&self) -> u128 {
        1u128 << self.depth
    }

    fn validate(&self) -> RangeResult<()> {
        Self::new(self.start, self.depth).map(|_| ())
    }
}

impl fmt::Debug for LinearRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Linear[{:#x}, 2^{}]", self.start, self.depth)
    }
}
