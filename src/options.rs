//! Rescan configuration and live update requests.
use std::sync::Arc;

use bitcoin::{Address, OutPoint, Txid};
use tokio::sync::watch;

use crate::{
    error::RescanError,
    filter_source::QueryOptions,
    hooks::{NoopHooks, RescanHooks},
    position::ChainPosition,
    store::Store,
};

/// Immutable configuration of one rescan, produced by [`RescanOptionsBuilder::build`].
#[derive(Clone)]
pub struct RescanOptions {
    pub(crate) start: Option<ChainPosition>,
    pub(crate) end: Option<ChainPosition>,
    pub(crate) watch_addrs: Vec<Address>,
    pub(crate) watch_outpoints: Vec<OutPoint>,
    pub(crate) watch_txids: Vec<Txid>,
    pub(crate) tx_idx: u32,
    pub(crate) query_options: QueryOptions,
    pub(crate) quit: Option<watch::Receiver<bool>>,
    pub(crate) hooks: Arc<dyn RescanHooks>,
    pub(crate) store: Option<Arc<dyn Store>>,
}

impl RescanOptions {
    /// Start building a configuration.
    pub fn builder() -> RescanOptionsBuilder {
        RescanOptionsBuilder::default()
    }

    /// Configured start position, if any.
    pub fn start(&self) -> Option<ChainPosition> {
        self.start
    }

    /// Configured end position, if any.
    pub fn end(&self) -> Option<ChainPosition> {
        self.end
    }

    /// Whether a quit signal was supplied.
    pub fn has_quit(&self) -> bool {
        self.quit.is_some()
    }

    /// Transaction index hint. The rescan itself ignores it; it is carried
    /// into [`crate::UtxoQuery::from_options`].
    pub fn tx_idx(&self) -> u32 {
        self.tx_idx
    }
}

/// Builder for [`RescanOptions`]. Watch methods are additive.
pub struct RescanOptionsBuilder {
    start: Option<ChainPosition>,
    end: Option<ChainPosition>,
    watch_addrs: Vec<Address>,
    watch_outpoints: Vec<OutPoint>,
    watch_txids: Vec<Txid>,
    tx_idx: u32,
    query_options: QueryOptions,
    quit: Option<watch::Receiver<bool>>,
    hooks: Arc<dyn RescanHooks>,
    store: Option<Arc<dyn Store>>,
}

impl Default for RescanOptionsBuilder {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            watch_addrs: vec![],
            watch_outpoints: vec![],
            watch_txids: vec![],
            tx_idx: 0,
            query_options: QueryOptions::default(),
            quit: None,
            hooks: Arc::new(NoopHooks),
            store: None,
        }
    }
}

impl RescanOptionsBuilder {
    /// Block the rescan starts after. No notifications are sent for it.
    /// Unset means "the backend's current tip" (or the saved progress, if a store is set).
    pub fn start_block(mut self, start: ChainPosition) -> Self {
        self.start = Some(start);
        self
    }

    /// Last block to scan. Without it a quit signal is mandatory.
    pub fn end_block(mut self, end: ChainPosition) -> Self {
        self.end = Some(end);
        self
    }

    /// Addresses to watch. Outputs paying them are watched for spends automatically.
    pub fn watch_addrs(mut self, addrs: impl IntoIterator<Item = Address>) -> Self {
        self.watch_addrs.extend(addrs);
        self
    }

    /// Outpoints to watch for spends.
    pub fn watch_outpoints(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.watch_outpoints.extend(outpoints);
        self
    }

    /// Transaction ids to watch.
    pub fn watch_txids(mut self, txids: impl IntoIterator<Item = Txid>) -> Self {
        self.watch_txids.extend(txids);
        self
    }

    /// Hint of the transaction's index in its block (coinbase is 0).
    /// Only read by `get_utxo` queries built with
    /// [`crate::UtxoQuery::from_options`].
    pub fn tx_idx(mut self, idx: u32) -> Self {
        self.tx_idx = idx;
        self
    }

    /// Options forwarded to every backend query.
    pub fn query_options(mut self, opts: QueryOptions) -> Self {
        self.query_options = opts;
        self
    }

    /// Quit signal for an open-ended rescan. Sending `true` (or dropping the
    /// sender) stops the rescan the next time it waits at the chain tip.
    pub fn quit(mut self, quit: watch::Receiver<bool>) -> Self {
        self.quit = Some(quit);
        self
    }

    /// Notification handlers.
    pub fn hooks(mut self, hooks: Arc<dyn RescanHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Persist progress after every connect/disconnect.
    pub fn progress_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// [`RescanError::MissingStopCondition`] if there is neither a quit signal
    /// nor an end block that could resolve to a non-zero height.
    pub fn build(self) -> Result<RescanOptions, RescanError> {
        let end_usable = self
            .end
            .map(|e| !e.has_zero_hash() || e.height != 0)
            .unwrap_or(false);
        if self.quit.is_none() && !end_usable {
            return Err(RescanError::MissingStopCondition);
        }

        Ok(RescanOptions {
            start: self.start,
            end: self.end,
            watch_addrs: self.watch_addrs,
            watch_outpoints: self.watch_outpoints,
            watch_txids: self.watch_txids,
            tx_idx: self.tx_idx,
            query_options: self.query_options,
            quit: self.quit,
            hooks: self.hooks,
            store: self.store,
        })
    }
}

/// A live change to a running rescan, consumed exactly once by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// Addresses to add to the watch set.
    pub addrs: Vec<Address>,
    /// Outpoints to add to the watch set.
    pub outpoints: Vec<OutPoint>,
    /// Txids to add to the watch set.
    pub txids: Vec<Txid>,
    /// Rewind so that the next connected block is `rewind + 1`. Zero means no rewind.
    pub rewind: u32,
}

impl UpdateRequest {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses to the filter.
    pub fn add_addrs(mut self, addrs: impl IntoIterator<Item = Address>) -> Self {
        self.addrs.extend(addrs);
        self
    }

    /// Add outpoints to the filter.
    pub fn add_outpoints(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.outpoints.extend(outpoints);
        self
    }

    /// Add txids to the filter.
    pub fn add_txids(mut self, txids: impl IntoIterator<Item = Txid>) -> Self {
        self.txids.extend(txids);
        self
    }

    /// Disconnect down to the block right after `height`, then rescan forward
    /// from there with the expanded filter.
    pub fn rewind(mut self, height: u32) -> Self {
        self.rewind = height;
        self
    }
}
