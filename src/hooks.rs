//! Wallet glue: notifications emitted by a running rescan.
//!
//! Every method has a no-op default, so implementors only override what they
//! care about. Hooks run inline on the rescan task; a slow hook stalls the scan.
use async_trait::async_trait;
use bitcoin::{block::Header, BlockHash, Transaction};

/// Where a relevant transaction was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDetails {
    /// Height of the containing block.
    pub height: u32,
    /// Hash of the containing block, as a display string.
    pub hash: String,
    /// Block timestamp (unix seconds).
    pub time: i64,
    /// Position of the transaction inside the block.
    pub index: usize,
}

/// Notification handlers for a rescan.
#[async_trait]
pub trait RescanHooks: Send + Sync {
    /// A block was connected (header-level notification).
    async fn block_connected(&self, _hash: BlockHash, _height: u32, _time: u32) {}

    /// A block was disconnected (header-level notification).
    async fn block_disconnected(&self, _hash: BlockHash, _height: u32, _time: u32) {}

    /// A block was processed; `relevant` holds the matching transactions
    /// (empty when the filter did not match).
    async fn filtered_block_connected(
        &self,
        _height: u32,
        _header: &Header,
        _relevant: &[Transaction],
    ) {
    }

    /// A previously connected block was rolled back.
    async fn filtered_block_disconnected(&self, _height: u32, _header: &Header) {}

    /// A transaction paid to a watched address.
    async fn received_funds(&self, _tx: &Transaction, _details: &BlockDetails) {}

    /// A transaction spent a watched outpoint.
    async fn redeeming_spend(&self, _tx: &Transaction, _details: &BlockDetails) {}
}

/// Hooks that ignore everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl RescanHooks for NoopHooks {}
