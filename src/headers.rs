use async_trait::async_trait;
use bitcoin::{block::Header, BlockHash};

/// Source of validated block headers (height ↔ hash).
#[async_trait]
pub trait HeaderSource: Send + Sync {
    /// Header and height for `hash`, `None` if unknown.
    async fn header_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<(Header, u32)>>;

    /// Header at an exact height on the best chain, `None` past the tip.
    async fn header_by_height(&self, height: u32) -> anyhow::Result<Option<Header>>;

    /// Best header the backend is synced to, with its height.
    async fn best_block(&self) -> anyhow::Result<(Header, u32)>;
}
