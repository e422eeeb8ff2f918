use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use rms_crypto::{Blake3Hasher, MerkleHasher};
use rms_merkle::Accumulator;
use rms_types::{Hash, Range};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

type KeyOf<R> = <R as Range>::Key;

/// Everything a session needs from local data.
///
/// Implementations answer hash queries for any range and stream the leaves
/// of a range in ascending key order.
pub trait Dataset {
    type Range: Range;
    type Contents: Clone + fmt::Debug;

    /// Accumulated hash of `range`; [`Hash::ZERO`] when nothing is known
    /// inside it.
    fn hash(&self, range: &Self::Range) -> Hash;

    fn root_hash(&self) -> Hash {
        self.hash(&Self::Range::root())
    }

    /// Key under which `contents` is stored.
    fn key_of(&self, contents: &Self::Contents) -> KeyOf<Self::Range>;

    /// Leaf hash of `contents`, as it would appear in the accumulator.
    fn digest(&self, contents: &Self::Contents) -> Hash;

    /// Up to `limit` leaves inside `range` in ascending key order, starting
    /// strictly after `after` when given.
    fn leaves(
        &self,
        range: &Self::Range,
        after: Option<&KeyOf<Self::Range>>,
        limit: usize,
    ) -> Vec<Self::Contents>;

    /// Merge `contents` into the dataset and return the leaf hash now held
    /// for its key.
    fn insert(&mut self, contents: Self::Contents) -> SyncResult<Hash>;
}

impl<D: Dataset + ?Sized> Dataset for &mut D {
    type Range = D::Range;
    type Contents = D::Contents;

    fn hash(&self, range: &Self::Range) -> Hash {
        (**self).hash(range)
    }

    fn key_of(&self, contents: &Self::Contents) -> KeyOf<Self::Range> {
        (**self).key_of(contents)
    }

    fn digest(&self, contents: &Self::Contents) -> Hash {
        (**self).digest(contents)
    }

    fn leaves(
        &self,
        range: &Self::Range,
        after: Option<&KeyOf<Self::Range>>,
        limit: usize,
    ) -> Vec<Self::Contents> {
        (**self).leaves(range, after, limit)
    }

    fn insert(&mut self, contents: Self::Contents) -> SyncResult<Hash> {
        (**self).insert(contents)
    }
}

/// How a store resolves two different values under one key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Keep the value with the greater leaf hash. Both peers pick the same
    /// winner, so divergent keys converge after one exchange.
    #[default]
    HighestHash,
    /// Never replace a stored value. Peers holding different values for a
    /// key stay divergent.
    KeepLocal,
}

/// Ordered storage of leaf contents, keyed by a range algebra's keys.
pub trait LeafStore {
    type Range: Range;
    type Contents: Clone + fmt::Debug;

    fn key_of(&self, contents: &Self::Contents) -> KeyOf<Self::Range>;

    fn digest(&self, contents: &Self::Contents) -> Hash;

    fn get(&self, key: &KeyOf<Self::Range>) -> Option<Self::Contents>;

    /// Merge `contents` with the stored value for its key and return the
    /// leaf hash of whichever value survives.
    fn merge(&mut self, contents: Self::Contents) -> SyncResult<Hash>;

    /// Up to `limit` contents inside `range`, ascending, after `after`.
    fn scan(
        &self,
        range: &Self::Range,
        after: Option<&KeyOf<Self::Range>>,
        limit: usize,
    ) -> Vec<Self::Contents>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A keyed value, the leaf contents carried by [`MemoryStore`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record<K> {
    pub key: K,
    pub value: Vec<u8>,
}

impl<K> Record<K> {
    pub fn new(key: K, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for Record<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({:?}, {} bytes)", self.key, self.value.len())
    }
}

/// In-memory ordered leaf store.
#[derive(Clone, Debug)]
pub struct MemoryStore<R: Range, H = Blake3Hasher> {
    records: BTreeMap<KeyOf<R>, Vec<u8>>,
    hasher: H,
    policy: MergePolicy,
    max_value_len: Option<usize>,
}

impl<R: Range> MemoryStore<R, Blake3Hasher> {
    pub fn new() -> Self {
        Self::with_hasher(Blake3Hasher::DEFAULT)
    }
}

impl<R: Range> Default for MemoryStore<R, Blake3Hasher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Range, H: MerkleHasher> MemoryStore<R, H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            records: BTreeMap::new(),
            hasher,
            policy: MergePolicy::default(),
            max_value_len: None,
        }
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reject values longer than `max` bytes on merge.
    pub fn with_max_value_len(mut self, max: usize) -> Self {
        self.max_value_len = Some(max);
        self
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// All records in key order.
    pub fn records(&self) -> impl Iterator<Item = Record<KeyOf<R>>> + '_ {
        self.records
            .iter()
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
    }
}

impl<R: Range, H: MerkleHasher> LeafStore for MemoryStore<R, H> {
    type Range = R;
    type Contents = Record<KeyOf<R>>;

    fn key_of(&self, contents: &Self::Contents) -> KeyOf<R> {
        contents.key.clone()
    }

    fn digest(&self, contents: &Self::Contents) -> Hash {
        self.hasher.hash_leaf(&contents.value)
    }

    fn get(&self, key: &KeyOf<R>) -> Option<Self::Contents> {
        self.records
            .get(key)
            .map(|v| Record::new(key.clone(), v.clone()))
    }

    fn merge(&mut self, contents: Self::Contents) -> SyncResult<Hash> {
        if let Some(max) = self.max_value_len {
            if contents.value.len() > max {
                return Err(SyncError::UnknownContents(format!(
                    "value for {:?} is {} bytes, limit {max}",
                    contents.key,
                    contents.value.len()
                )));
            }
        }
        let incoming = self.hasher.hash_leaf(&contents.value);
        let Some(existing) = self.records.get(&contents.key) else {
            self.records.insert(contents.key, contents.value);
            return Ok(incoming);
        };
        let current = self.hasher.hash_leaf(existing);
        let replace = match self.policy {
            MergePolicy::HighestHash => incoming > current,
            MergePolicy::KeepLocal => false,
        };
        if replace {
            debug!(key = ?contents.key, "replacing divergent value");
            self.records.insert(contents.key, contents.value);
            Ok(incoming)
        } else {
            Ok(current)
        }
    }

    fn scan(&self, range: &R, after: Option<&KeyOf<R>>, limit: usize) -> Vec<Self::Contents> {
        let first = range.first_key();
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(&first),
        };
        self.records
            .range::<KeyOf<R>, _>((lower, Bound::Unbounded))
            .take_while(|(k, _)| range.contains_key(k))
            .take(limit)
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// A leaf store paired with the accumulator summarizing it.
///
/// Every write goes through the store first; the accumulator then records
/// the hash of the surviving value, so the two never disagree.
#[derive(Clone, Debug)]
pub struct Replica<A, S> {
    accumulator: A,
    store: S,
}

impl<A, S> Replica<A, S>
where
    A: Accumulator,
    S: LeafStore<Range = A::Range>,
{
    pub fn new(accumulator: A, store: S) -> Self {
        Self { accumulator, store }
    }

    pub fn accumulator(&self) -> &A {
        &self.accumulator
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_parts(self) -> (A, S) {
        (self.accumulator, self.store)
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl<A, S> Dataset for Replica<A, S>
where
    A: Accumulator,
    S: LeafStore<Range = A::Range>,
{
    type Range = A::Range;
    type Contents = S::Contents;

    fn hash(&self, range: &Self::Range) -> Hash {
        self.accumulator.get(range)
    }

    fn key_of(&self, contents: &Self::Contents) -> KeyOf<Self::Range> {
        self.store.key_of(contents)
    }

    fn digest(&self, contents: &Self::Contents) -> Hash {
        self.store.digest(contents)
    }

    fn leaves(
        &self,
        range: &Self::Range,
        after: Option<&KeyOf<Self::Range>>,
        limit: usize,
    ) -> Vec<Self::Contents> {
        self.store.scan(range, after, limit)
    }

    fn insert(&mut self, contents: Self::Contents) -> SyncResult<Hash> {
        let key = self.store.key_of(&contents);
        let hash = self.store.merge(contents)?;
        self.accumulator.set(&key, hash)?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rms_merkle::SparseAccumulator;
    use rms_types::{LinearRange, PrefixRange};

    type Linear = Replica<SparseAccumulator<LinearRange>, MemoryStore<LinearRange>>;

    fn linear(keys: &[u64]) -> Linear {
        let mut replica = Replica::new(SparseAccumulator::new(), MemoryStore::new());
        for &k in keys {
            replica.insert(Record::new(k, k.to_be_bytes())).unwrap();
        }
        replica
    }

    #[test]
    fn insert_updates_hashes() {
        let replica = linear(&[0, 5]);
        assert_eq!(replica.len(), 2);
        assert!(!replica.root_hash().is_zero());
        let leaf = replica.hash(&LinearRange::leaf(&5));
        assert_eq!(leaf, replica.digest(&Record::new(5, 5u64.to_be_bytes())));
        assert!(replica.hash(&LinearRange::leaf(&1)).is_zero());
    }

    #[test]
    fn leaves_stay_inside_range() {
        let replica = linear(&[1, 2, 3, 8, 9, 40]);
        let keys: Vec<u64> = replica
            .leaves(&LinearRange::new(0, 3).unwrap(), None, 10)
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn leaves_resume_after_key() {
        let replica = linear(&[1, 2, 3, 4, 5]);
        let root = LinearRange::root();
        let first: Vec<u64> = replica.leaves(&root, None, 2).into_iter().map(|r| r.key).collect();
        assert_eq!(first, vec![1, 2]);
        let rest: Vec<u64> = replica
            .leaves(&root, Some(&2), 10)
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[test]
    fn prefix_scan_skips_shorter_keys() {
        let mut replica: Replica<SparseAccumulator<PrefixRange>, MemoryStore<PrefixRange>> =
            Replica::new(SparseAccumulator::new(), MemoryStore::new());
        for k in ["a", "ab", "abc", "ac", "b"] {
            replica.insert(Record::new(k.as_bytes().to_vec(), k)).unwrap();
        }
        let range = PrefixRange::new(b"ab".to_vec(), 8).unwrap();
        let keys: Vec<Vec<u8>> = replica.leaves(&range, None, 10).into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![b"ab".to_vec(), b"abc".to_vec()]);
    }

    #[test]
    fn highest_hash_wins() {
        let mut store = MemoryStore::<LinearRange>::new();
        let a = Record::new(7u64, b"alpha".to_vec());
        let b = Record::new(7u64, b"beta".to_vec());
        let (ha, hb) = (store.digest(&a), store.digest(&b));
        let winner = if ha > hb { a.clone() } else { b.clone() };

        store.merge(a.clone()).unwrap();
        let kept = store.merge(b.clone()).unwrap();
        assert_eq!(kept, ha.max(hb));
        assert_eq!(store.get(&7), Some(winner.clone()));

        let mut other = MemoryStore::<LinearRange>::new();
        other.merge(b).unwrap();
        other.merge(a).unwrap();
        assert_eq!(other.get(&7), Some(winner));
    }

    #[test]
    fn keep_local_never_replaces() {
        let mut store = MemoryStore::<LinearRange>::new().with_policy(MergePolicy::KeepLocal);
        let first = Record::new(1u64, b"one".to_vec());
        let hash = store.merge(first.clone()).unwrap();
        assert_eq!(store.merge(Record::new(1, b"uno".to_vec())).unwrap(), hash);
        assert_eq!(store.get(&1), Some(first));
    }

    #[test]
    fn oversized_value_rejected() {
        let mut store = MemoryStore::<LinearRange>::new().with_max_value_len(4);
        let err = store.merge(Record::new(1, vec![0u8; 5])).unwrap_err();
        assert!(matches!(err, SyncError::UnknownContents(_)));
        assert!(store.is_empty());
    }

    fn write_one<D: Dataset<Contents = Record<u64>>>(mut dataset: D) {
        dataset.insert(Record::new(3, b"x".to_vec())).unwrap();
    }

    #[test]
    fn borrowed_dataset_writes_through() {
        let mut replica = linear(&[]);
        write_one(&mut replica);
        assert_eq!(replica.len(), 1);
        assert!(!replica.root_hash().is_zero());
    }
}
