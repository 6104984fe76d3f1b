//! Shared test fixtures: an in-memory chain backend, a recording hook set and
//! an in-memory progress store.
#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::bip158::{BlockFilter, BlockFilterWriter, Error as BfError};
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version as BlockVersion},
    consensus,
    hash_types::TxMerkleNode,
    hashes::Hash,
    pow::CompactTarget,
    transaction, Address, Amount, Block, BlockHash, Network, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, WPubkeyHash, Witness,
};
use filter_rescan::prelude::*;
use filter_rescan::subscription::BlockNotifier;
use filter_rescan::watch::outpoint_filter_entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Regtest P2WPKH address and its script for a one-byte key-hash pattern.
pub fn address(byte: u8) -> (Address, ScriptBuf) {
    let script = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([byte; 20]));
    let addr = Address::from_script(&script, Network::Regtest).unwrap();
    (addr, script)
}

/// One-input one-output transaction.
pub fn pay(prev: OutPoint, to: &ScriptBuf, sats: u64) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: to.clone(),
        }],
    }
}

/// An outpoint that no mined transaction creates.
pub fn foreign_outpoint(byte: u8) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([byte; 32]), 0)
}

fn coinbase(height: u32, nonce: u32) -> Transaction {
    let burn = ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0xee; 20]));
    let mut tx = pay(OutPoint::null(), &burn, 50_000);
    tx.input[0].script_sig = ScriptBuf::builder()
        .push_int(i64::from(height))
        .push_int(i64::from(nonce))
        .into_script();
    tx
}

struct Sub {
    id: u64,
    notifier: BlockNotifier,
}

#[derive(Default)]
struct State {
    best: Vec<BlockHash>,
    blocks: HashMap<BlockHash, (Block, u32)>,
    basic: HashMap<BlockHash, Option<Vec<u8>>>,
    extended: HashMap<BlockHash, Option<Vec<u8>>>,
    prevouts: HashMap<OutPoint, ScriptBuf>,
    missing_blocks: Vec<BlockHash>,
    failing_filters: Vec<BlockHash>,
    subs: Vec<Sub>,
    next_sub: u64,
    nonce: u32,
    bip158_basic: bool,
    // Call counters.
    basic_fetches: usize,
    extended_fetches: usize,
    block_fetches: Vec<u32>,
    header_calls: usize,
    unsubscribed: Vec<u64>,
}

/// In-memory chain backend.
///
/// Basic filters commit to output scripts and spent outpoints; extended
/// filters commit to txids. With [`MockChain::with_bip158`] the basic filter
/// is a real BIP-158 script filter instead.
pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    /// Chain holding only a genesis block.
    pub fn new() -> Arc<Self> {
        let chain = Arc::new(Self {
            state: Mutex::new(State::default()),
        });
        chain.mine(vec![]);
        chain
    }

    /// Chain whose basic filters are real BIP-158 script filters.
    pub fn with_bip158() -> Arc<Self> {
        let chain = Arc::new(Self {
            state: Mutex::new(State {
                bip158_basic: true,
                ..State::default()
            }),
        });
        chain.mine(vec![]);
        chain
    }

    /// Mine `n` empty blocks.
    pub fn mine_empty(&self, n: u32) {
        for _ in 0..n {
            self.mine(vec![]);
        }
    }

    /// Mine a block on the best tip holding a coinbase plus `txs`.
    pub fn mine(&self, txs: Vec<Transaction>) -> Block {
        let mut st = self.state.lock().unwrap();
        let block = Self::connect(&mut st, txs);
        for sub in &st.subs {
            sub.notifier.block_connected(block.header);
        }
        block
    }

    /// Drop the top `depth` blocks, notifying subscribers tip-first.
    pub fn disconnect(&self, depth: u32) {
        let mut st = self.state.lock().unwrap();
        for _ in 0..depth {
            let Some(hash) = st.best.pop() else { break };
            let header = st.blocks[&hash].0.header;
            for sub in &st.subs {
                sub.notifier.block_disconnected(header);
            }
        }
    }

    fn connect(st: &mut State, txs: Vec<Transaction>) -> Block {
        let height = st.best.len() as u32;
        st.nonce += 1;
        let prev = st.best.last().copied().unwrap_or_else(BlockHash::all_zeros);

        let mut txdata = vec![coinbase(height, st.nonce)];
        txdata.extend(txs);
        let block = Block {
            header: Header {
                version: BlockVersion::from_consensus(2),
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_600_000_000 + height,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: st.nonce,
            },
            txdata,
        };
        let hash = block.block_hash();

        let basic = if st.bip158_basic {
            let prevouts = &st.prevouts;
            BlockFilter::new_script_filter(&block, |op: &OutPoint| -> Result<ScriptBuf, BfError> {
                Ok(prevouts.get(op).cloned().unwrap_or_default())
            })
            .unwrap()
            .content
        } else {
            let mut elems: Vec<Vec<u8>> = Vec::new();
            for tx in &block.txdata {
                for out in &tx.output {
                    elems.push(out.script_pubkey.to_bytes());
                }
                for txin in &tx.input {
                    if !txin.previous_output.is_null() {
                        elems.push(outpoint_filter_entry(&txin.previous_output));
                    }
                }
            }
            filter_for(&block, &elems)
        };
        let txids: Vec<Vec<u8>> = block
            .txdata
            .iter()
            .map(|tx| tx.compute_txid().as_byte_array().to_vec())
            .collect();
        let extended = filter_for(&block, &txids);

        for tx in &block.txdata {
            let txid = tx.compute_txid();
            for (vout, out) in tx.output.iter().enumerate() {
                st.prevouts
                    .insert(OutPoint::new(txid, vout as u32), out.script_pubkey.clone());
            }
        }
        st.basic.insert(hash, Some(basic));
        st.extended.insert(hash, Some(extended));
        st.blocks.insert(hash, (block.clone(), height));
        st.best.push(hash);
        block
    }

    /// Replace the basic filter of `hash` (None = backend has no filter).
    pub fn set_basic_filter(&self, hash: BlockHash, filter: Option<Vec<u8>>) {
        self.state.lock().unwrap().basic.insert(hash, filter);
    }

    /// Make the backend "lose" a block body.
    pub fn drop_block_body(&self, hash: BlockHash) {
        self.state.lock().unwrap().missing_blocks.push(hash);
    }

    /// Make filter lookups for `hash` fail with an I/O error.
    pub fn fail_filters(&self, hash: BlockHash) {
        self.state.lock().unwrap().failing_filters.push(hash);
    }

    pub fn hash_at(&self, height: u32) -> BlockHash {
        self.state.lock().unwrap().best[height as usize]
    }

    pub fn tip_height(&self) -> u32 {
        self.state.lock().unwrap().best.len() as u32 - 1
    }

    pub fn block_fetches(&self) -> Vec<u32> {
        self.state.lock().unwrap().block_fetches.clone()
    }

    pub fn basic_fetches(&self) -> usize {
        self.state.lock().unwrap().basic_fetches
    }

    pub fn extended_fetches(&self) -> usize {
        self.state.lock().unwrap().extended_fetches
    }

    pub fn header_calls(&self) -> usize {
        self.state.lock().unwrap().header_calls
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subs.len()
    }

    pub fn unsubscribed(&self) -> Vec<u64> {
        self.state.lock().unwrap().unsubscribed.clone()
    }

    /// Wait (bounded) until some rescan holds a subscription.
    pub async fn wait_subscribed(&self) {
        let res = tokio::time::timeout(Duration::from_secs(5), async {
            while self.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(res.is_ok(), "rescan never subscribed");
    }
}

/// GCS filter over arbitrary elements, keyed by `block`'s hash.
pub fn filter_for(block: &Block, elems: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut writer = BlockFilterWriter::new(&mut out, block);
    for e in elems {
        writer.add_element(e);
    }
    writer.finish().unwrap();
    out
}

#[async_trait]
impl HeaderSource for MockChain {
    async fn header_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<(Header, u32)>> {
        let mut st = self.state.lock().unwrap();
        st.header_calls += 1;
        Ok(st.blocks.get(&hash).map(|(b, h)| (b.header, *h)))
    }

    async fn header_by_height(&self, height: u32) -> anyhow::Result<Option<Header>> {
        let mut st = self.state.lock().unwrap();
        st.header_calls += 1;
        Ok(st
            .best
            .get(height as usize)
            .map(|hash| st.blocks[hash].0.header))
    }

    async fn best_block(&self) -> anyhow::Result<(Header, u32)> {
        let mut st = self.state.lock().unwrap();
        st.header_calls += 1;
        let hash = *st.best.last().unwrap();
        let (block, height) = &st.blocks[&hash];
        Ok((block.header, *height))
    }
}

#[async_trait]
impl FilterSource for MockChain {
    async fn get_basic_filter(
        &self,
        block: BlockHash,
        _opts: &QueryOptions,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let mut st = self.state.lock().unwrap();
        st.basic_fetches += 1;
        if st.failing_filters.contains(&block) {
            anyhow::bail!("peer timed out");
        }
        Ok(st.basic.get(&block).cloned().flatten())
    }

    async fn get_extended_filter(
        &self,
        block: BlockHash,
        _opts: &QueryOptions,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let mut st = self.state.lock().unwrap();
        st.extended_fetches += 1;
        if st.failing_filters.contains(&block) {
            anyhow::bail!("peer timed out");
        }
        Ok(st.extended.get(&block).cloned().flatten())
    }

    async fn get_block(
        &self,
        block: BlockHash,
        _opts: &QueryOptions,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let mut st = self.state.lock().unwrap();
        if st.missing_blocks.contains(&block) {
            return Ok(None);
        }
        let Some((b, height)) = st.blocks.get(&block) else {
            return Ok(None);
        };
        let raw = consensus::encode::serialize(b);
        let height = *height;
        st.block_fetches.push(height);
        Ok(Some(raw))
    }
}

#[async_trait]
impl BlockSubscriber for MockChain {
    async fn subscribe(&self) -> anyhow::Result<BlockSubscription> {
        let mut st = self.state.lock().unwrap();
        st.next_sub += 1;
        let id = st.next_sub;
        let (notifier, sub) = BlockSubscription::channel(id);
        st.subs.push(Sub { id, notifier });
        Ok(sub)
    }

    async fn unsubscribe(&self, id: u64) {
        let mut st = self.state.lock().unwrap();
        st.subs.retain(|s| s.id != id);
        st.unsubscribed.push(id);
    }
}

/// Everything a rescan told its hooks, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(u32),
    Disconnected(u32),
    FilteredConnected(u32, Vec<Txid>),
    FilteredDisconnected(u32),
    Received(u32, Txid),
    Redeemed(u32, Txid),
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    // (height, nth filtered connect at that height, release)
    gates: Mutex<Vec<(u32, usize, oneshot::Receiver<()>)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Heights of filtered-connect notifications, in order.
    pub fn connected_heights(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::FilteredConnected(h, _) => Some(h),
                _ => None,
            })
            .collect()
    }

    /// Relevant txids reported for `height` (last report wins).
    pub fn relevant_at(&self, height: u32) -> Option<Vec<Txid>> {
        self.events().into_iter().rev().find_map(|e| match e {
            Event::FilteredConnected(h, txs) if h == height => Some(txs),
            _ => None,
        })
    }

    /// Wait (bounded) until `pred` holds for the recorded events.
    pub async fn wait_until(&self, pred: impl Fn(&[Event]) -> bool) {
        let res = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if pred(&self.events()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(res.is_ok(), "timed out; events so far: {:?}", self.events());
    }

    /// Hold the rescan inside the `nth` filtered connect of `height` until
    /// the returned sender fires (or is dropped).
    pub fn pause_at(&self, height: u32, nth: usize) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().push((height, nth, rx));
        tx
    }

    /// Number of filtered connects recorded for `height`.
    pub fn filtered_connects(&self, height: u32) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::FilteredConnected(h, _) if *h == height))
            .count()
    }

    /// Events recorded after the `nth` filtered connect of `height`.
    pub fn events_after(&self, height: u32, nth: usize) -> Vec<Event> {
        let events = self.events();
        let mut seen = 0;
        let idx = events
            .iter()
            .position(|e| {
                if matches!(e, Event::FilteredConnected(h, _) if *h == height) {
                    seen += 1;
                }
                seen == nth
            })
            .expect("connect not recorded");
        events[idx + 1..].to_vec()
    }

    fn push(&self, e: Event) {
        self.events.lock().unwrap().push(e);
    }

    fn take_gate(&self, height: u32, nth: usize) -> Option<oneshot::Receiver<()>> {
        let mut gates = self.gates.lock().unwrap();
        let idx = gates.iter().position(|(h, n, _)| *h == height && *n == nth)?;
        Some(gates.remove(idx).2)
    }
}

#[async_trait]
impl RescanHooks for Recorder {
    async fn block_connected(&self, _hash: BlockHash, height: u32, _time: u32) {
        self.push(Event::Connected(height));
    }

    async fn block_disconnected(&self, _hash: BlockHash, height: u32, _time: u32) {
        self.push(Event::Disconnected(height));
    }

    async fn filtered_block_connected(&self, height: u32, _header: &Header, relevant: &[Transaction]) {
        let txids = relevant.iter().map(|tx| tx.compute_txid()).collect();
        self.push(Event::FilteredConnected(height, txids));
        if let Some(gate) = self.take_gate(height, self.filtered_connects(height)) {
            let _ = gate.await;
        }
    }

    async fn filtered_block_disconnected(&self, height: u32, _header: &Header) {
        self.push(Event::FilteredDisconnected(height));
    }

    async fn received_funds(&self, tx: &Transaction, details: &BlockDetails) {
        self.push(Event::Received(details.height, tx.compute_txid()));
    }

    async fn redeeming_spend(&self, tx: &Transaction, details: &BlockDetails) {
        self.push(Event::Redeemed(details.height, tx.compute_txid()));
    }
}

/// Minimal in-memory Store for tests.
#[derive(Default)]
pub struct MemStore {
    tip: Mutex<Option<(u32, BlockHash)>>,
}

#[async_trait]
impl Store for MemStore {
    async fn load_rescan_tip(&self) -> anyhow::Result<Option<(u32, BlockHash)>> {
        Ok(*self.tip.lock().unwrap())
    }

    async fn save_rescan_tip(&self, height: u32, hash: BlockHash) -> anyhow::Result<()> {
        *self.tip.lock().unwrap() = Some((height, hash));
        Ok(())
    }
}
