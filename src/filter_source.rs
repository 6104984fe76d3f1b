//! Abstractions for fetching compact filters and blocks (from a local cache or the network).
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::BlockHash;

/// Per-query knobs forwarded untouched to the backend.
///
/// The engine never retries on its own; retry policy lives in the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// How long a single query may take before the backend gives up.
    pub timeout: Option<Duration>,
    /// How many times the backend may retry a failed query.
    pub retries: u8,
}

impl QueryOptions {
    /// Set the per-query timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry count.
    pub fn with_retries(mut self, retries: u8) -> Self {
        self.retries = retries;
        self
    }
}

/// Provider of per-block compact filters and full blocks.
///
/// `Ok(None)` means the backend has no such item; `Err` is an I/O failure and
/// aborts the calling operation.
#[async_trait]
pub trait FilterSource: Send + Sync {
    /// Raw basic (script/outpoint) filter for `block`.
    async fn get_basic_filter(
        &self,
        block: BlockHash,
        opts: &QueryOptions,
    ) -> anyhow::Result<Option<Vec<u8>>>;

    /// Raw extended filter for `block` (commits to txids).
    async fn get_extended_filter(
        &self,
        block: BlockHash,
        opts: &QueryOptions,
    ) -> anyhow::Result<Option<Vec<u8>>>;

    /// Raw consensus-encoded block bytes for `block` (used after a filter hit).
    async fn get_block(
        &self,
        block: BlockHash,
        opts: &QueryOptions,
    ) -> anyhow::Result<Option<Vec<u8>>>;
}
