use bitcoin::{hashes::Hash, BlockHash};

/// A block identified by hash and height.
///
/// A zero hash means "only the height is known"; the engine resolves the
/// missing half against the backend before using a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainPosition {
    /// Block hash, or all-zeros when unknown.
    pub hash: BlockHash,
    /// Block height.
    pub height: u32,
}

impl ChainPosition {
    /// Position with both halves known.
    pub fn new(hash: BlockHash, height: u32) -> Self {
        Self { hash, height }
    }

    /// Position known only by height.
    pub fn from_height(height: u32) -> Self {
        Self {
            hash: BlockHash::all_zeros(),
            height,
        }
    }

    /// Position known only by hash.
    pub fn from_hash(hash: BlockHash) -> Self {
        Self { hash, height: 0 }
    }

    /// True when the hash half is unset.
    pub fn has_zero_hash(&self) -> bool {
        self.hash == BlockHash::all_zeros()
    }

    /// The stop test used after each processed block: either half matching
    /// counts as reaching `end`.
    pub fn reached(&self, end: &ChainPosition) -> bool {
        self.hash == end.hash || self.height == end.height
    }
}
