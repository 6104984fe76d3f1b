//! Rescan state machine:
//! 1) catch up block-by-block via height lookups,
//! 2) test each block's compact filters against the watch set,
//! 3) fetch matching blocks and notify the hooks,
//! 4) once at the tip, follow connect/disconnect notifications and live updates.
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bitcoin::{block::Header, consensus, hashes::Hash, Block, BlockHash};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    error::RescanError,
    filter_source::QueryOptions,
    hooks::RescanHooks,
    matcher::block_matches,
    options::{RescanOptions, UpdateRequest},
    position::ChainPosition,
    relevance::relevant_txs,
    store::Store,
    subscription::{BlockSubscription, ChainEvent, ChainSource},
    watch::WatchSet,
};

/// An update in flight from [`crate::Rescan::update`]; `ack` fires once the
/// engine has taken it.
pub(crate) struct PendingUpdate {
    pub(crate) request: UpdateRequest,
    pub(crate) ack: oneshot::Sender<()>,
}

/// The block the scan currently sits on.
struct Cursor {
    pos: ChainPosition,
    header: Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    CatchingUp,
    FollowingTip,
}

enum TipEvent {
    Quit,
    Update(PendingUpdate),
    Connected(Header),
    Disconnected(Header),
}

/// Single-task rescan engine. Owns its watch set and position; nothing else
/// mutates them while it runs.
pub struct RescanEngine<C: ?Sized> {
    chain: Arc<C>,
    hooks: Arc<dyn RescanHooks>,
    store: Option<Arc<dyn Store>>,
    query: QueryOptions,
    quit: Option<watch::Receiver<bool>>,
    updates: Option<mpsc::Receiver<PendingUpdate>>,
    watch: WatchSet,
    start: Option<ChainPosition>,
    end: Option<ChainPosition>,
    subscription: Option<BlockSubscription>,
}

impl<C> RescanEngine<C>
where
    C: ChainSource + ?Sized,
{
    /// Build an engine without a live update channel.
    pub fn new(chain: Arc<C>, opts: RescanOptions) -> Self {
        Self::with_updates(chain, opts, None)
    }

    pub(crate) fn with_updates(
        chain: Arc<C>,
        opts: RescanOptions,
        updates: Option<mpsc::Receiver<PendingUpdate>>,
    ) -> Self {
        let mut watch = WatchSet::new();
        watch.add_watch(&opts.watch_addrs, &opts.watch_outpoints, &opts.watch_txids);
        Self {
            chain,
            hooks: opts.hooks,
            store: opts.store,
            query: opts.query_options,
            quit: opts.quit,
            updates,
            watch,
            start: opts.start,
            end: opts.end,
            subscription: None,
        }
    }

    /// Run the rescan until the end block is processed or the quit signal fires.
    ///
    /// # Errors
    /// Any backend lookup, filter or block fetch failure aborts the rescan.
    /// [`RescanError::MissingStopCondition`] if the end block cannot be
    /// resolved and no quit signal was given.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let res = self.scan().await;
        if let Some(sub) = self.subscription.take() {
            self.chain.unsubscribe(sub.id).await;
        }
        res
    }

    async fn scan(&mut self) -> anyhow::Result<()> {
        self.end = self.resolve_end().await?;
        if self.quit.is_none() && self.end.is_none() {
            return Err(RescanError::MissingStopCondition.into());
        }

        let mut cur = self.resolve_start().await?;
        log::trace!(
            "starting rescan from known block {} ({})",
            cur.pos.height,
            cur.pos.hash
        );
        if let Some(end) = self.end {
            if cur.pos.height >= end.height {
                log::debug!("rescan start {} is not below end {}", cur.pos.height, end.height);
                return Ok(());
            }
        }

        let mut mode = Mode::CatchingUp;
        loop {
            match mode {
                Mode::FollowingTip => match self.next_tip_event().await? {
                    TipEvent::Quit => {
                        log::trace!("rescan quit at {} ({})", cur.pos.height, cur.pos.hash);
                        return Ok(());
                    }
                    TipEvent::Update(pending) => {
                        if self.apply_update(pending, &mut cur).await? {
                            mode = Mode::CatchingUp;
                        }
                        continue;
                    }
                    TipEvent::Disconnected(header) => {
                        if header.block_hash() == cur.pos.hash {
                            self.disconnect_tip(&mut cur).await?;
                        }
                        continue;
                    }
                    TipEvent::Connected(header) => {
                        // Anything not building on our block is stale or from the future.
                        if header.prev_blockhash != cur.pos.hash {
                            continue;
                        }
                        cur.pos = ChainPosition::new(header.block_hash(), cur.pos.height + 1);
                        cur.header = header;
                    }
                },
                Mode::CatchingUp => {
                    let next = cur.pos.height + 1;
                    let header = self
                        .chain
                        .header_by_height(next)
                        .await
                        .with_context(|| format!("header_by_height({next})"))?;
                    let Some(header) = header else {
                        if self.subscription.is_none() {
                            log::trace!(
                                "rescan became current at {} ({}), subscribing to block notifications",
                                cur.pos.height,
                                cur.pos.hash
                            );
                            self.subscription =
                                Some(self.chain.subscribe().await.context("subscribe")?);
                            // A block may have landed before the subscription existed.
                            continue;
                        }
                        mode = Mode::FollowingTip;
                        continue;
                    };
                    if header.prev_blockhash != cur.pos.hash {
                        log::debug!(
                            "block {} ({}) was reorganized out, stepping back",
                            cur.pos.height,
                            cur.pos.hash
                        );
                        self.disconnect_tip(&mut cur).await?;
                        continue;
                    }
                    cur.pos = ChainPosition::new(header.block_hash(), next);
                    cur.header = header;
                }
            }

            if self.connect_block(&cur).await? {
                log::trace!("rescan reached end block {} ({})", cur.pos.height, cur.pos.hash);
                return Ok(());
            }

            // At most one pending update per processed block.
            let pending = self.updates.as_mut().and_then(|rx| rx.try_recv().ok());
            if let Some(pending) = pending {
                if self.apply_update(pending, &mut cur).await? {
                    mode = Mode::CatchingUp;
                }
            }
        }
    }

    /// Notify, match, fetch and extract for the block under `cur`.
    /// Returns true once the end block has been processed.
    async fn connect_block(&mut self, cur: &Cursor) -> anyhow::Result<bool> {
        let ChainPosition { hash, height } = cur.pos;
        self.hooks.block_connected(hash, height, cur.header.time).await;

        let matched = block_matches(
            &*self.chain,
            hash,
            height,
            self.watch.filter_entries(),
            self.watch.has_txids(),
            &self.query,
        )
        .await?;

        let relevant = if matched {
            let raw = self
                .chain
                .get_block(hash, &self.query)
                .await
                .with_context(|| format!("get_block({hash})"))?
                .ok_or(RescanError::BlockNotFound { height, hash })?;
            let block: Block = consensus::encode::deserialize(&raw)
                .with_context(|| format!("block deserialize @height {height}"))?;
            relevant_txs(&block, height, &mut self.watch, &*self.hooks).await
        } else {
            Vec::new()
        };

        self.hooks
            .filtered_block_connected(height, &cur.header, &relevant)
            .await;
        self.save_progress(&cur.pos).await?;

        Ok(self.end.map(|end| cur.pos.reached(&end)).unwrap_or(false))
    }

    /// Handle a disconnect of the block we sit on, as reported by the backend.
    async fn disconnect_tip(&mut self, cur: &mut Cursor) -> anyhow::Result<()> {
        self.hooks
            .filtered_block_disconnected(cur.pos.height, &cur.header)
            .await;
        self.hooks
            .block_disconnected(cur.pos.hash, cur.pos.height, cur.header.time)
            .await;
        self.step_back(cur).await
    }

    /// Merge an update into the watch set and rewind if it asks for it.
    /// Returns whether any block was disconnected.
    async fn apply_update(
        &mut self,
        pending: PendingUpdate,
        cur: &mut Cursor,
    ) -> anyhow::Result<bool> {
        let PendingUpdate { request, ack } = pending;
        // The submitter only waits for hand-off, not for the rewind.
        let _ = ack.send(());

        self.watch
            .add_watch(&request.addrs, &request.outpoints, &request.txids);
        log::debug!(
            "rescan update: +{} addrs, +{} outpoints, +{} txids, rewind {}",
            request.addrs.len(),
            request.outpoints.len(),
            request.txids.len(),
            request.rewind
        );
        if request.rewind == 0 {
            return Ok(false);
        }

        let mut rewound = false;
        while cur.pos.height > request.rewind {
            self.hooks
                .block_disconnected(cur.pos.hash, cur.pos.height, cur.header.time)
                .await;
            self.hooks
                .filtered_block_disconnected(cur.pos.height, &cur.header)
                .await;
            self.step_back(cur).await?;
            rewound = true;
        }
        Ok(rewound)
    }

    /// Move `cur` to its parent block.
    async fn step_back(&mut self, cur: &mut Cursor) -> anyhow::Result<()> {
        let parent = cur.header.prev_blockhash;
        let (header, _) = self
            .chain
            .header_by_hash(parent)
            .await
            .with_context(|| format!("header_by_hash({parent})"))?
            .ok_or_else(|| anyhow!("parent {parent} of block {} is unknown", cur.pos.height))?;
        cur.pos = ChainPosition::new(parent, cur.pos.height.saturating_sub(1));
        cur.header = header;
        self.save_progress(&cur.pos).await
    }

    async fn next_tip_event(&mut self) -> anyhow::Result<TipEvent> {
        let Some(sub) = self.subscription.as_mut() else {
            return Err(anyhow!("following the tip without a block subscription"));
        };
        tokio::select! {
            biased;
            _ = quit_signal(&mut self.quit) => Ok(TipEvent::Quit),
            Some(pending) = recv_update(&mut self.updates) => Ok(TipEvent::Update(pending)),
            // Chain events keep the backend's order across both streams.
            event = sub.next_event() => event.map(|event| match event {
                ChainEvent::Connected(header) => TipEvent::Connected(header),
                ChainEvent::Disconnected(header) => TipEvent::Disconnected(header),
            }),
        }
    }

    async fn save_progress(&self, pos: &ChainPosition) -> anyhow::Result<()> {
        if let Some(store) = &self.store {
            store
                .save_rescan_tip(pos.height, pos.hash)
                .await
                .with_context(|| format!("save rescan progress @height {}", pos.height))?;
        }
        Ok(())
    }

    async fn resolve_start(&self) -> anyhow::Result<Cursor> {
        let mut pos = match self.start {
            Some(pos) => pos,
            None => self.default_start().await?,
        };

        if !pos.has_zero_hash() {
            let found = self
                .chain
                .header_by_hash(pos.hash)
                .await
                .with_context(|| format!("header_by_hash({})", pos.hash))?;
            match found {
                Some((header, height)) => {
                    return Ok(Cursor {
                        pos: ChainPosition::new(pos.hash, height),
                        header,
                    })
                }
                None => {
                    log::warn!("start block {} unknown, falling back to its height", pos.hash);
                    pos.hash = BlockHash::all_zeros();
                }
            }
        }

        if pos.height != 0 {
            let found = self
                .chain
                .header_by_height(pos.height)
                .await
                .with_context(|| format!("header_by_height({})", pos.height))?;
            match found {
                Some(header) => {
                    return Ok(Cursor {
                        pos: ChainPosition::new(header.block_hash(), pos.height),
                        header,
                    })
                }
                None => log::warn!("start height {} unknown, starting from genesis", pos.height),
            }
        }

        let genesis = self
            .chain
            .header_by_height(0)
            .await
            .context("header_by_height(0)")?
            .ok_or_else(|| anyhow!("backend has no genesis header"))?;
        Ok(Cursor {
            pos: ChainPosition::new(genesis.block_hash(), 0),
            header: genesis,
        })
    }

    async fn default_start(&self) -> anyhow::Result<ChainPosition> {
        if let Some(store) = &self.store {
            let saved = store
                .load_rescan_tip()
                .await
                .context("load rescan progress")?;
            if let Some((height, hash)) = saved {
                log::debug!("resuming rescan from saved block {height} ({hash})");
                return Ok(ChainPosition::new(hash, height));
            }
        }
        let (header, height) = self.chain.best_block().await.context("best_block")?;
        Ok(ChainPosition::new(header.block_hash(), height))
    }

    /// Resolve the end block. An end that only names a height beyond the
    /// current tip is kept as height-only and stops the scan once reached.
    async fn resolve_end(&self) -> anyhow::Result<Option<ChainPosition>> {
        let Some(mut end) = self.end else {
            return Ok(None);
        };

        if !end.has_zero_hash() {
            let found = self
                .chain
                .header_by_hash(end.hash)
                .await
                .with_context(|| format!("header_by_hash({})", end.hash))?;
            match found {
                Some((_, height)) => return Ok(Some(ChainPosition::new(end.hash, height))),
                None => {
                    log::warn!("end block {} unknown, falling back to its height", end.hash);
                    end.hash = BlockHash::all_zeros();
                }
            }
        }

        if end.height == 0 {
            return Ok(None);
        }
        let found = self
            .chain
            .header_by_height(end.height)
            .await
            .with_context(|| format!("header_by_height({})", end.height))?;
        Ok(Some(match found {
            Some(header) => ChainPosition::new(header.block_hash(), end.height),
            None => ChainPosition::from_height(end.height),
        }))
    }
}

/// Resolves once quit is requested (or its sender is gone); never without a signal.
async fn quit_signal(quit: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = quit else {
        return std::future::pending().await;
    };
    loop {
        let quit_now = *rx.borrow_and_update();
        if quit_now {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn recv_update(
    updates: &mut Option<mpsc::Receiver<PendingUpdate>>,
) -> Option<PendingUpdate> {
    match updates {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
