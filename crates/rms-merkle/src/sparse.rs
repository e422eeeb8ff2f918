use std::collections::BTreeMap;

use rms_crypto::{Blake3Hasher, MerkleHasher};
use rms_types::{Hash, Range, RangeResult};
use tracing::trace;

use crate::traits::Accumulator;

/// Map-backed Merkle accumulator.
///
/// Stores a hash only for ranges on the path from the root to some key, in
/// an ordered map keyed by range. Cheap to build for sparse key sets; every
/// ancestor update re-keys into the map.
#[derive(Clone, Debug)]
pub struct SparseAccumulator<R: Range, H = Blake3Hasher> {
    hasher: H,
    nodes: BTreeMap<R, Hash>,
    root: Option<R>,
}

impl<R: Range> SparseAccumulator<R, Blake3Hasher> {
    /// Create an empty accumulator with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(Blake3Hasher::DEFAULT)
    }
}

impl<R: Range> Default for SparseAccumulator<R, Blake3Hasher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Range, H: MerkleHasher> SparseAccumulator<R, H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            hasher,
            nodes: BTreeMap::new(),
            root: None,
        }
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    fn stored(&self, range: &R) -> Hash {
        self.nodes.get(range).copied().unwrap_or(Hash::ZERO)
    }

    /// Replace the root with its parent until it contains `leaf`, storing
    /// each new ancestor with the old root as its only child.
    fn grow(&mut self, mut root: R, leaf: &R) -> R {
        while !root.contains(leaf) {
            let below = self.stored(&root);
            let parent = root.parent();
            let hash = if root.is_left_child() {
                self.hasher.combine(&below, &Hash::ZERO)
            } else {
                self.hasher.combine(&Hash::ZERO, &below)
            };
            trace!(from = ?root, to = ?parent, "growing sparse root");
            self.nodes.insert(parent.clone(), hash);
            root = parent;
        }
        root
    }
}

impl<R: Range, H: MerkleHasher> Accumulator for SparseAccumulator<R, H> {
    type Range = R;

    fn get(&self, range: &R) -> Hash {
        if let Some(hash) = self.nodes.get(range) {
            return *hash;
        }
        match &self.root {
            Some(root) if range.contains(root) => self.stored(root),
            _ => Hash::ZERO,
        }
    }

    fn set(&mut self, key: &R::Key, hash: Hash) -> RangeResult<()> {
        let leaf = R::leaf(key);
        let root = match self.root.take() {
            Some(root) => self.grow(root, &leaf),
            None => {
                self.nodes.insert(leaf.clone(), hash);
                self.root = Some(leaf);
                return Ok(());
            }
        };

        let mut path = vec![root.clone()];
        let mut current = root;
        while current != leaf {
            let (_, child) = current.child_toward(&leaf)?;
            path.push(child.clone());
            current = child;
        }

        self.nodes.insert(leaf, hash);
        for range in path.iter().rev().skip(1) {
            let (left, right) = range.split()?;
            let combined = self.hasher.combine(&self.stored(&left), &self.stored(&right));
            self.nodes.insert(range.clone(), combined);
        }
        self.root = path.into_iter().next();
        Ok(())
    }

    fn root(&self) -> Option<R> {
        self.root.clone()
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn ranges(&self) -> Vec<R> {
        self.nodes.keys().cloned().collect()
    }
}
