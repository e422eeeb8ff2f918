use rms_types::Hash;

/// Pluggable hash function for Merkle accumulators.
///
/// Implementations must uphold:
/// - `combine(ZERO, ZERO) == ZERO`, so an empty subtree hashes to zero at
///   every level.
/// - Neither `hash_leaf` nor `combine` with a non-zero input ever yields
///   [`Hash::ZERO`] (assumed from collision resistance).
pub trait MerkleHasher: Clone + Send + Sync + 'static {
    /// Hash raw leaf content.
    fn hash_leaf(&self, data: &[u8]) -> Hash;

    /// Hash two child hashes into their parent.
    fn combine(&self, left: &Hash, right: &Hash) -> Hash;
}

/// Domain-separated BLAKE3 Merkle hasher.
///
/// Leaves and interior nodes are hashed under distinct tags derived from
/// the domain, so a leaf can never be confused with an interior node
/// carrying the same bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Blake3Hasher {
    domain: &'static str,
}

impl Blake3Hasher {
    /// Default hasher for range Merkle sync.
    pub const DEFAULT: Self = Self {
        domain: "rms-merkle-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }

    /// Verify that `data` hashes to `expected` as a leaf.
    pub fn verify_leaf(&self, data: &[u8], expected: &Hash) -> bool {
        self.hash_leaf(data) == *expected
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl MerkleHasher for Blake3Hasher {
    fn hash_leaf(&self, data: &[u8]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":leaf:");
        hasher.update(data);
        Hash::from_digest(*hasher.finalize().as_bytes())
    }

    fn combine(&self, left: &Hash, right: &Hash) -> Hash {
        if left.is_zero() && right.is_zero() {
            return Hash::ZERO;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":node:");
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        Hash::from_digest(*hasher.finalize().as_bytes())
    }
}
