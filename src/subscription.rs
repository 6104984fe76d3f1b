//! Live block notifications from the backend.
//!
//! Connects and disconnects travel on two streams. Every notification carries
//! a sequence number drawn from one counter shared by both streams, so the
//! receiving side can put them back into the order the backend sent them.
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bitcoin::block::Header;
use tokio::sync::mpsc::{
    error::TryRecvError, unbounded_channel, UnboundedReceiver, UnboundedSender,
};

use crate::{filter_source::FilterSource, headers::HeaderSource};

/// One notification on either stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockNotification {
    /// Position in the backend's delivery order across both streams.
    pub seq: u64,
    /// Header of the block connected or disconnected.
    pub header: Header,
}

/// A chain event, in backend order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainEvent {
    Connected(Header),
    Disconnected(Header),
}

/// Backend half of a subscription: stamps and sends notifications.
///
/// Calls must happen in chain order (one task at a time); the stamp is what
/// preserves that order for the receiver.
#[derive(Debug)]
pub struct BlockNotifier {
    seq: AtomicU64,
    connected: UnboundedSender<BlockNotification>,
    disconnected: UnboundedSender<BlockNotification>,
}

impl BlockNotifier {
    /// Announce a newly connected block. False once the subscriber is gone.
    pub fn block_connected(&self, header: Header) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.connected.send(BlockNotification { seq, header }).is_ok()
    }

    /// Announce a block removed from the best chain. False once the subscriber is gone.
    pub fn block_disconnected(&self, header: Header) -> bool {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.disconnected.send(BlockNotification { seq, header }).is_ok()
    }
}

/// An active subscription: two streams plus the id used to cancel it.
#[derive(Debug)]
pub struct BlockSubscription {
    /// Backend-assigned id, handed back to [`BlockSubscriber::unsubscribe`].
    pub id: u64,
    connected: UnboundedReceiver<BlockNotification>,
    disconnected: UnboundedReceiver<BlockNotification>,
    // Received but not yet handed out.
    next_connected: Option<BlockNotification>,
    next_disconnected: Option<BlockNotification>,
}

impl BlockSubscription {
    /// New subscription with id `id` and the notifier that feeds it.
    pub fn channel(id: u64) -> (BlockNotifier, Self) {
        let (ctx, crx) = unbounded_channel();
        let (dtx, drx) = unbounded_channel();
        let notifier = BlockNotifier {
            seq: AtomicU64::new(0),
            connected: ctx,
            disconnected: dtx,
        };
        let sub = Self {
            id,
            connected: crx,
            disconnected: drx,
            next_connected: None,
            next_disconnected: None,
        };
        (notifier, sub)
    }

    /// Next event in backend order, waiting if none is queued.
    ///
    /// Cancel safe: anything received before the future is dropped stays
    /// buffered for the next call. Errors once a stream closes with
    /// nothing left to deliver.
    pub(crate) async fn next_event(&mut self) -> anyhow::Result<ChainEvent> {
        loop {
            if self.next_connected.is_none() {
                self.next_connected = try_take(&mut self.connected);
            }
            if self.next_disconnected.is_none() {
                self.next_disconnected = try_take(&mut self.disconnected);
            }

            match (self.next_connected, self.next_disconnected) {
                (Some(c), Some(d)) if d.seq < c.seq => {
                    self.next_disconnected = None;
                    return Ok(ChainEvent::Disconnected(d.header));
                }
                (Some(c), _) => {
                    self.next_connected = None;
                    return Ok(ChainEvent::Connected(c.header));
                }
                (None, Some(d)) => {
                    self.next_disconnected = None;
                    return Ok(ChainEvent::Disconnected(d.header));
                }
                (None, None) => {}
            }

            // Nothing queued. Whatever arrives first is the lowest pending
            // stamp, but loop again so a same-time arrival on the other
            // stream is compared too.
            tokio::select! {
                n = self.connected.recv() => {
                    let n = n.ok_or_else(|| anyhow::anyhow!("block connect stream closed"))?;
                    self.next_connected = Some(n);
                }
                n = self.disconnected.recv() => {
                    let n = n.ok_or_else(|| anyhow::anyhow!("block disconnect stream closed"))?;
                    self.next_disconnected = Some(n);
                }
            }
        }
    }
}

fn try_take(rx: &mut UnboundedReceiver<BlockNotification>) -> Option<BlockNotification> {
    match rx.try_recv() {
        Ok(n) => Some(n),
        Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
    }
}

/// Backend side of block notifications.
#[async_trait]
pub trait BlockSubscriber: Send + Sync {
    /// Start delivering connect/disconnect notifications, typically by
    /// keeping the [`BlockNotifier`] from [`BlockSubscription::channel`].
    async fn subscribe(&self) -> anyhow::Result<BlockSubscription>;

    /// Stop delivering to the subscription with `id`.
    async fn unsubscribe(&self, id: u64);
}

/// Everything the rescan engine needs from a chain backend.
pub trait ChainSource: HeaderSource + FilterSource + BlockSubscriber {}

impl<T> ChainSource for T where T: HeaderSource + FilterSource + BlockSubscriber + ?Sized {}
