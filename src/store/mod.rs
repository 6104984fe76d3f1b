//! Persistence of rescan progress so an interrupted scan can resume.
use async_trait::async_trait;
use bitcoin::BlockHash;

/// Minimal persistence interface: the last block the rescan has connected.
#[async_trait]
pub trait Store: Send + Sync {
    /// Last connected position `(height, block_hash)`, if any was saved.
    async fn load_rescan_tip(&self) -> anyhow::Result<Option<(u32, BlockHash)>>;

    /// Record the current position. Called after every connect and disconnect.
    async fn save_rescan_tip(&self, height: u32, hash: BlockHash) -> anyhow::Result<()>;
}

#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
