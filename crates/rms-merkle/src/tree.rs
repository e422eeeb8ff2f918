use rms_crypto::{Blake3Hasher, MerkleHasher};
use rms_types::{Hash, Range, RangeResult, Side};
use tracing::trace;

use crate::traits::Accumulator;

/// Index of a node in the arena.
type NodeIdx = usize;

#[derive(Clone, Debug)]
struct Node<R> {
    range: R,
    hash: Hash,
    children: [Option<NodeIdx>; 2],
}

impl<R> Node<R> {
    fn new(range: R, hash: Hash) -> Self {
        Self {
            range,
            hash,
            children: [None, None],
        }
    }
}

fn slot(side: Side) -> usize {
    match side {
        Side::Left => 0,
        Side::Right => 1,
    }
}

/// Pointer-tree Merkle accumulator.
///
/// Holds an explicit binary tree in an arena of owned nodes; a parent
/// refers to its children by index. Nodes are never freed while the
/// accumulator lives, and updates rewrite hashes in place along one path
/// without touching the map keys of any other node.
#[derive(Clone, Debug)]
pub struct TreeAccumulator<R: Range, H = Blake3Hasher> {
    hasher: H,
    nodes: Vec<Node<R>>,
    root: Option<NodeIdx>,
}

impl<R: Range> TreeAccumulator<R, Blake3Hasher> {
    /// Create an empty accumulator with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(Blake3Hasher::DEFAULT)
    }
}

impl<R: Range> Default for TreeAccumulator<R, Blake3Hasher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Range, H: MerkleHasher> TreeAccumulator<R, H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            hasher,
            nodes: Vec::new(),
            root: None,
        }
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    fn push(&mut self, node: Node<R>) -> NodeIdx {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn child_hash(&self, idx: NodeIdx, slot: usize) -> Hash {
        self.nodes[idx].children[slot]
            .map(|c| self.nodes[c].hash)
            .unwrap_or(Hash::ZERO)
    }

    fn grow(&mut self, mut root: NodeIdx, leaf: &R) -> NodeIdx {
        while !self.nodes[root].range.contains(leaf) {
            let below = &self.nodes[root];
            let parent_range = below.range.parent();
            let side = if below.range.is_left_child() {
                Side::Left
            } else {
                Side::Right
            };
            let hash = match side {
                Side::Left => self.hasher.combine(&below.hash, &Hash::ZERO),
                Side::Right => self.hasher.combine(&Hash::ZERO, &below.hash),
            };
            trace!(from = ?below.range, to = ?parent_range, "growing tree root");
            let mut parent = Node::new(parent_range, hash);
            parent.children[slot(side)] = Some(root);
            root = self.push(parent);
        }
        root
    }
}

impl<R: Range, H: MerkleHasher> Accumulator for TreeAccumulator<R, H> {
    type Range = R;

    fn get(&self, range: &R) -> Hash {
        let Some(mut idx) = self.root else {
            return Hash::ZERO;
        };
        let root = &self.nodes[idx];
        if range.contains(&root.range) {
            return root.hash;
        }
        if !root.range.contains(range) {
            return Hash::ZERO;
        }
        loop {
            let node = &self.nodes[idx];
            if node.range == *range {
                return node.hash;
            }
            let Ok((side, _)) = node.range.child_toward(range) else {
                return Hash::ZERO;
            };
            match node.children[slot(side)] {
                Some(child) => idx = child,
                None => return Hash::ZERO,
            }
        }
    }

    fn set(&mut self, key: &R::Key, hash: Hash) -> RangeResult<()> {
        let leaf = R::leaf(key);
        let root = match self.root {
            Some(root) => self.grow(root, &leaf),
            None => {
                let idx = self.push(Node::new(leaf, hash));
                self.root = Some(idx);
                return Ok(());
            }
        };
        self.root = Some(root);

        let mut path = vec![root];
        let mut idx = root;
        while self.nodes[idx].range != leaf {
            let (side, child_range) = self.nodes[idx].range.child_toward(&leaf)?;
            idx = match self.nodes[idx].children[slot(side)] {
                Some(child) => child,
                None => {
                    let child = self.push(Node::new(child_range, Hash::ZERO));
                    self.nodes[idx].children[slot(side)] = Some(child);
                    child
                }
            };
            path.push(idx);
        }

        self.nodes[idx].hash = hash;
        for &i in path.iter().rev().skip(1) {
            let combined = self.hasher.combine(&self.child_hash(i, 0), &self.child_hash(i, 1));
            self.nodes[i].hash = combined;
        }
        Ok(())
    }

    fn root(&self) -> Option<R> {
        self.root.map(|idx| self.nodes[idx].range.clone())
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn ranges(&self) -> Vec<R> {
        let mut ranges: Vec<R> = self.nodes.iter().map(|n| n.range.clone()).collect();
        ranges.sort();
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseAccumulator;
    use crate::testing::{assert_consistent, leaf_hash};
    use proptest::prelude::*;
    use rms_types::{LinearRange, PrefixRange};

    #[test]
    fn empty_tree() {
        let acc = TreeAccumulator::<LinearRange>::new();
        assert!(acc.is_empty());
        assert!(acc.root_hash().is_zero());
        assert!(acc.get(&LinearRange::leaf(&0)).is_zero());
    }

    #[test]
    fn missing_child_reads_zero() {
        let mut acc = TreeAccumulator::<LinearRange>::new();
        acc.set(&0, leaf_hash(0)).unwrap();
        acc.set(&5, leaf_hash(5)).unwrap();
        assert!(acc.get(&LinearRange::leaf(&1)).is_zero());
        assert!(acc.get(&LinearRange::new(2, 1).unwrap()).is_zero());
        assert_eq!(acc.get(&LinearRange::leaf(&5)), leaf_hash(5));
        assert_consistent(&acc);
    }

    #[test]
    fn rewrite_reuses_nodes() {
        let mut acc = TreeAccumulator::<LinearRange>::new();
        acc.set(&10, leaf_hash(10)).unwrap();
        acc.set(&11, leaf_hash(11)).unwrap();
        let nodes = acc.len();
        acc.set(&11, leaf_hash(12)).unwrap();
        assert_eq!(acc.len(), nodes);
        assert_eq!(acc.get(&LinearRange::leaf(&11)), leaf_hash(12));
    }

    #[test]
    fn matches_sparse_for_prefix_keys() {
        let mut tree = TreeAccumulator::<PrefixRange>::new();
        let mut sparse = SparseAccumulator::<PrefixRange>::new();
        for (i, k) in ["", "a", "ab", "b", "zz"].iter().enumerate() {
            let h = leaf_hash(i as u64);
            tree.set(&k.as_bytes().to_vec(), h).unwrap();
            sparse.set(&k.as_bytes().to_vec(), h).unwrap();
        }
        assert_eq!(tree.root(), sparse.root());
        assert_eq!(tree.root_hash(), sparse.root_hash());
        assert_eq!(tree.ranges(), sparse.ranges());
        assert_consistent(&tree);
    }

    proptest! {
        #[test]
        fn agrees_with_sparse(
            entries in proptest::collection::vec((0u64..1 << 20, 0u64..8), 1..40),
            probes in proptest::collection::vec((0u64..1 << 20, 0u8..21), 0..20),
        ) {
            let mut tree = TreeAccumulator::<LinearRange>::new();
            let mut sparse = SparseAccumulator::<LinearRange>::new();
            for (k, v) in entries {
                tree.set(&k, leaf_hash(v)).unwrap();
                sparse.set(&k, leaf_hash(v)).unwrap();
            }
            prop_assert_eq!(tree.root_hash(), sparse.root_hash());
            prop_assert_eq!(tree.ranges(), sparse.ranges());
            for range in sparse.ranges() {
                prop_assert_eq!(tree.get(&range), sparse.get(&range));
            }
            for (start, depth) in probes {
                let start = start & !((1u64 << depth) - 1);
                let range = LinearRange::new(start, depth).unwrap();
                prop_assert_eq!(tree.get(&range), sparse.get(&range));
            }
            assert_consistent(&tree);
        }
    }
}
