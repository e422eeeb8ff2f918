use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RangeError, RangeResult};
use crate::range::Range;

/// A binary-prefix range over byte-string keys.
///
/// With a prefix of `n` bytes and `bits = b`, the range holds every string
/// that starts with the first `n - 1` prefix bytes, has at least `n` bytes,
/// and whose `n`-th byte agrees with the prefix's last byte in its top `b`
/// bits. With `bits = LEAF` it holds exactly the prefix itself.
///
/// A range is *byte-complete* when it holds every extension of its prefix
/// (empty prefix, or `b = 8`). Such a range splits into the leaf for the
/// prefix itself and the range of strictly longer extensions; any other
/// range splits on the next bit of its last byte.
///
/// Canonical form: bits of the last byte below the top `b` are zero, and an
/// empty prefix only appears with `b = 0` (the root) or as the empty-string
/// leaf.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPrefixRange")]
pub struct PrefixRange {
    prefix: Vec<u8>,
    bits: u8,
}

#[derive(Deserialize)]
struct RawPrefixRange {
    prefix: Vec<u8>,
    bits: u8,
}

impl TryFrom<RawPrefixRange> for PrefixRange {
    type Error = RangeError;

    fn try_from(raw: RawPrefixRange) -> RangeResult<Self> {
        Self::new(raw.prefix, raw.bits)
    }
}

/// Mask of the bits below the top `bits` of a byte.
fn low_mask(bits: u8) -> u8 {
    if bits >= 8 {
        0
    } else {
        0xFF >> bits
    }
}

impl PrefixRange {
    /// Marker for the singleton range holding exactly the prefix.
    pub const LEAF: u8 = u8::MAX;

    /// Build a range, enforcing canonical form.
    pub fn new(prefix: Vec<u8>, bits: u8) -> RangeResult<Self> {
        if bits != Self::LEAF {
            if bits > 8 {
                return Err(RangeError::InvalidBits(bits));
            }
            match prefix.last() {
                None if bits != 0 => return Err(RangeError::InvalidBits(bits)),
                Some(&byte) if byte & low_mask(bits) != 0 => {
                    return Err(RangeError::NonCanonicalPrefix { byte, bits })
                }
                _ => {}
            }
        }
        Ok(Self { prefix, bits })
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    fn is_complete(&self) -> bool {
        !self.is_leaf() && (self.prefix.is_empty() || self.bits == 8)
    }

    /// The byte-complete range of all extensions of `prefix`.
    fn complete(prefix: Vec<u8>) -> Self {
        let bits = if prefix.is_empty() { 0 } else { 8 };
        Self { prefix, bits }
    }
}

impl Range for PrefixRange {
    type Key = Vec<u8>;

    fn root() -> Self {
        Self {
            prefix: Vec::new(),
            bits: 0,
        }
    }

    fn leaf(key: &Vec<u8>) -> Self {
        Self {
            prefix: key.clone(),
            bits: Self::LEAF,
        }
    }

    fn is_leaf(&self) -> bool {
        self.bits == Self::LEAF
    }

    fn is_root(&self) -> bool {
        self.prefix.is_empty() && self.bits == 0
    }

    fn split(&self) -> RangeResult<(Self, Self)> {
        if self.is_leaf() {
            return Err(RangeError::InvalidOperation(format!(
                "cannot split leaf range {self:?}"
            )));
        }
        if self.is_complete() {
            let mut longer = self.prefix.clone();
            longer.push(0);
            let left = Self::leaf(&self.prefix);
            let right = Self {
                prefix: longer,
                bits: 0,
            };
            return Ok((left, right));
        }
        let bits = self.bits + 1;
        let left = Self {
            prefix: self.prefix.clone(),
            bits,
        };
        let mut right = left.clone();
        if let Some(last) = right.prefix.last_mut() {
            *last |= 0x80 >> self.bits;
        }
        Ok((left, right))
    }

    fn parent(&self) -> Self {
        if self.is_leaf() {
            return Self::complete(self.prefix.clone());
        }
        if self.is_root() {
            return self.clone();
        }
        if self.bits == 0 {
            let shorter = self.prefix[..self.prefix.len() - 1].to_vec();
            return Self::complete(shorter);
        }
        let bits = self.bits - 1;
        let mut prefix = self.prefix.clone();
        if let Some(last) = prefix.last_mut() {
            *last &= !low_mask(bits);
        }
        Self { prefix, bits }
    }

    fn contains(&self, inner: &Self) -> bool {
        if self.is_leaf() {
            return self == inner;
        }
        if self.is_complete() {
            return inner.prefix.starts_with(&self.prefix)
                && (self.prefix.is_empty()
                    || inner.prefix.len() > self.prefix.len()
                    || inner.is_leaf()
                    || inner.bits == 8);
        }
        let n = self.prefix.len();
        if inner.prefix.len() < n || inner.prefix[..n - 1] != self.prefix[..n - 1] {
            return false;
        }
        if inner.prefix[n - 1] & !low_mask(self.bits) != self.prefix[n - 1] {
            return false;
        }
        inner.prefix.len() > n || inner.is_leaf() || inner.bits >= self.bits
    }

    fn is_left_child(&self) -> bool {
        if self.is_leaf() {
            return true;
        }
        if self.is_root() || self.bits == 0 {
            return false;
        }
        match self.prefix.last() {
            Some(last) => last & (0x80 >> (self.bits - 1)) == 0,
            None => false,
        }
    }

    /// Canonical form keeps the low bits of the last byte clear, so the
    /// prefix itself is always the smallest member.
    fn first_key(&self) -> Vec<u8> {
        self.prefix.clone()
    }

    fn size(&self) -> u128 {
        if self.is_leaf() {
            1
        } else {
            u128::MAX
        }
    }

    fn validate(&self) -> RangeResult<()> {
        Self::new(self.prefix.clone(), self.bits).map(|_| ())
    }
}

impl fmt::Debug for PrefixRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_leaf() {
            write!(f, "Prefix[{}]", hex::encode(&self.prefix))
        } else {
            write!(f, "Prefix[{}/{}]", hex::encode(&self.prefix), self.bits)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn arb_range() -> impl Strategy<Value = PrefixRange> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..4).prop_map(|k| PrefixRange::leaf(&k)),
            (proptest::collection::vec(any::<u8>(), 1..4), 0u8..=8).prop_map(|(mut p, bits)| {
                if let Some(last) = p.last_mut() {
                    *last &= !low_mask(bits);
                }
                PrefixRange { prefix: p, bits }
            }),
            Just(PrefixRange::root()),
        ]
    }

    #[test]
    fn root_contains_all_keys() {
        let root = PrefixRange::root();
        assert!(root.contains_key(&key("")));
        assert!(root.contains_key(&key("abc")));
        assert_eq!(root.parent(), root);
    }

    #[test]
    fn root_split_separates_empty_string() {
        let (left, right) = PrefixRange::root().split().unwrap();
        assert_eq!(left, PrefixRange::leaf(&Vec::new()));
        assert!(right.contains_key(&key("a")));
        assert!(!right.contains_key(&key("")));
    }

    #[test]
    fn bit_split_partitions_last_byte() {
        let r = PrefixRange::new(vec![0x00], 0).unwrap();
        let (left, right) = r.split().unwrap();
        assert_eq!(left, PrefixRange::new(vec![0x00], 1).unwrap());
        assert_eq!(right, PrefixRange::new(vec![0x80], 1).unwrap());
        assert!(left.contains_key(&key("a")));
        assert!(right.contains_key(&vec![0xC3, 0x01]));
        assert!(!left.contains_key(&vec![0xC3]));
    }

    #[test]
    fn complete_range_holds_prefix_and_extensions() {
        let r = PrefixRange::new(key("ab"), 8).unwrap();
        assert!(r.contains_key(&key("ab")));
        assert!(r.contains_key(&key("abc")));
        assert!(!r.contains_key(&key("ac")));
        assert!(!r.contains_key(&key("a")));
        let (leaf, longer) = r.split().unwrap();
        assert!(leaf.is_leaf());
        assert_eq!(longer, PrefixRange::new(vec![b'a', b'b', 0], 0).unwrap());
    }

    #[test]
    fn ab_and_ac_diverge_at_low_bits() {
        // 'b' = 0x62, 'c' = 0x63: only the final bit differs.
        let ab = PrefixRange::leaf(&key("ab"));
        let ac = PrefixRange::leaf(&key("ac"));
        let shared = ab
            .ancestors()
            .find(|a| a.contains(&ac))
            .unwrap();
        assert_eq!(shared, PrefixRange::new(key("ab"), 7).unwrap());
    }

    #[test]
    fn new_rejects_non_canonical() {
        assert_eq!(
            PrefixRange::new(vec![0x01], 4),
            Err(RangeError::NonCanonicalPrefix { byte: 0x01, bits: 4 })
        );
        assert_eq!(PrefixRange::new(vec![], 3), Err(RangeError::InvalidBits(3)));
        assert_eq!(PrefixRange::new(vec![1], 9), Err(RangeError::InvalidBits(9)));
        assert!(PrefixRange::new(vec![0x01], PrefixRange::LEAF).is_ok());
    }

    #[test]
    fn split_leaf_is_invalid() {
        let err = PrefixRange::leaf(&key("x")).split().unwrap_err();
        assert!(matches!(err, RangeError::InvalidOperation(_)));
    }

    #[test]
    fn deserialize_validates() {
        let bad: Result<PrefixRange, _> = serde_json::from_str(r#"{"prefix":[255],"bits":2}"#);
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn contains_self(r in arb_range()) {
            prop_assert!(r.contains(&r));
            prop_assert!(r.validate().is_ok());
        }

        #[test]
        fn split_laws(r in arb_range()) {
            prop_assume!(!r.is_leaf());
            let (l, h) = r.split().unwrap();
            prop_assert_ne!(&l, &h);
            prop_assert!(r.contains(&l));
            prop_assert!(r.contains(&h));
            prop_assert!(!l.contains(&h) && !h.contains(&l));
            prop_assert_eq!(l.parent(), r.clone());
            prop_assert_eq!(h.parent(), r.clone());
            prop_assert!(l.is_left_child());
            prop_assert!(h.is_right_child());
            prop_assert!(l.validate().is_ok() && h.validate().is_ok());
        }

        #[test]
        fn first_key_is_smallest_member(
            r in arb_range(),
            k in proptest::collection::vec(any::<u8>(), 0..5),
        ) {
            prop_assert!(r.contains_key(&r.first_key()));
            if r.contains_key(&k) {
                prop_assert!(r.first_key() <= k);
            }
        }

        #[test]
        fn leaf_reaches_root(k in proptest::collection::vec(any::<u8>(), 0..6)) {
            let leaf = PrefixRange::leaf(&k);
            let chain: Vec<PrefixRange> = leaf.ancestors().collect();
            prop_assert_eq!(chain.last(), Some(&PrefixRange::root()));
            for pair in chain.windows(2) {
                prop_assert!(pair[1].contains(&pair[0]));
                prop_assert!(pair[1].contains_key(&k));
            }
        }

        #[test]
        fn exactly_one_child_holds_key(
            k in proptest::collection::vec(any::<u8>(), 0..5),
            level in 1usize..40,
        ) {
            let chain: Vec<PrefixRange> = PrefixRange::leaf(&k).ancestors().collect();
            let r = &chain[level.min(chain.len() - 1)];
            prop_assume!(!r.is_leaf());
            let (l, h) = r.split().unwrap();
            prop_assert!(l.contains_key(&k) ^ h.contains_key(&k));
        }
    }
}
