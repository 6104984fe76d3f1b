//! Backward scan for the creation or spend of a single output.
use anyhow::{anyhow, Context};
use bitcoin::{consensus, hashes::Hash, Block, BlockHash, OutPoint, Transaction, TxOut};

use crate::{
    error::RescanError,
    filter_source::{FilterSource, QueryOptions},
    headers::HeaderSource,
    matcher::block_matches,
    options::RescanOptions,
    position::ChainPosition,
    watch::outpoint_filter_entry,
};

/// Spentness of an output, as found on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendReport {
    /// The output was spent.
    Spent {
        /// Transaction that spent it.
        spending_tx: Transaction,
        /// Input of `spending_tx` that references the output.
        input_index: u32,
        /// Height of the block containing `spending_tx`.
        height: u32,
    },
    /// The output exists and nothing after its creation spends it.
    Unspent {
        /// The output itself.
        output: TxOut,
    },
}

/// Arguments for [`get_utxo`].
#[derive(Debug, Clone, Default)]
pub struct UtxoQuery {
    outpoints: Vec<OutPoint>,
    start: Option<ChainPosition>,
    tx_idx: u32,
    query_options: QueryOptions,
}

impl UtxoQuery {
    /// Query for one outpoint.
    pub fn new(outpoint: OutPoint) -> Self {
        Self::default().watch_outpoints([outpoint])
    }

    /// Query carrying the start block, outpoints, tx-index hint and query
    /// options of a rescan configuration.
    pub fn from_options(opts: &RescanOptions) -> Self {
        Self {
            outpoints: opts.watch_outpoints.clone(),
            start: opts.start,
            tx_idx: opts.tx_idx,
            query_options: opts.query_options.clone(),
        }
    }

    /// Add outpoints. `get_utxo` accepts exactly one in total.
    pub fn watch_outpoints(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.outpoints.extend(outpoints);
        self
    }

    /// Earliest block the output could have been created in (default: genesis).
    pub fn start_block(mut self, start: ChainPosition) -> Self {
        self.start = Some(start);
        self
    }

    /// Index of the creating transaction inside its block, if known (coinbase is 0).
    pub fn tx_idx(mut self, idx: u32) -> Self {
        self.tx_idx = idx;
        self
    }

    /// Options forwarded to every backend query.
    pub fn query_options(mut self, opts: QueryOptions) -> Self {
        self.query_options = opts;
        self
    }
}

/// Walk backwards from the chain tip to the start block (inclusive) looking
/// for the spend or the creation of the queried output. A spend wins over the
/// creation when both are in range.
///
/// Returns `Ok(None)` when the range holds neither.
///
/// # Errors
/// [`RescanError::OutPointCount`] unless exactly one outpoint was given (no
/// backend I/O is done in that case). Any header, filter or block fetch
/// failure aborts the scan.
pub async fn get_utxo<C>(chain: &C, query: UtxoQuery) -> anyhow::Result<Option<SpendReport>>
where
    C: HeaderSource + FilterSource + ?Sized,
{
    let [op] = *query.outpoints.as_slice() else {
        return Err(RescanError::OutPointCount(query.outpoints.len()).into());
    };
    let entries = vec![outpoint_filter_entry(&op), op.txid.as_byte_array().to_vec()];

    let (tip_header, tip_height) = chain.best_block().await.context("best_block")?;
    let mut cur = ChainPosition::new(tip_header.block_hash(), tip_height);
    let start = resolve_start(chain, query.start, &cur).await?;
    log::trace!(
        "starting scan for output spend from known block {} ({}) back to block {} ({})",
        cur.height,
        cur.hash,
        start.height,
        start.hash
    );

    loop {
        // The txid entry is only committed to by the extended filter.
        let matched = block_matches(
            chain,
            cur.hash,
            cur.height,
            &entries,
            true,
            &query.query_options,
        )
        .await?;

        if matched {
            let raw = chain
                .get_block(cur.hash, &query.query_options)
                .await
                .with_context(|| format!("get_block({})", cur.hash))?
                .ok_or(RescanError::BlockNotFound {
                    height: cur.height,
                    hash: cur.hash,
                })?;
            let block: Block = consensus::encode::deserialize(&raw)
                .with_context(|| format!("block deserialize @height {}", cur.height))?;

            if let Some(report) = find_spend(&block, &op, cur.height) {
                return Ok(Some(report));
            }
            if let Some(tx) = find_creator(&block, &op, query.tx_idx) {
                let output = tx.output.get(op.vout as usize).cloned();
                if output.is_none() {
                    log::warn!("output {op} is out of range for its transaction");
                }
                return Ok(output.map(|output| SpendReport::Unspent { output }));
            }
        }

        if cur.height <= start.height {
            return Ok(None);
        }
        cur.height -= 1;
        let header = chain
            .header_by_height(cur.height)
            .await
            .with_context(|| format!("header_by_height({})", cur.height))?
            .ok_or_else(|| anyhow!("no header at height {} below the tip", cur.height))?;
        cur.hash = header.block_hash();
    }
}

fn find_spend(block: &Block, op: &OutPoint, height: u32) -> Option<SpendReport> {
    block.txdata.iter().find_map(|tx| {
        tx.input
            .iter()
            .position(|txin| txin.previous_output == *op)
            .map(|i| SpendReport::Spent {
                spending_tx: tx.clone(),
                input_index: i as u32,
                height,
            })
    })
}

fn find_creator<'a>(block: &'a Block, op: &OutPoint, tx_idx: u32) -> Option<&'a Transaction> {
    block
        .txdata
        .get(tx_idx as usize)
        .filter(|tx| tx.compute_txid() == op.txid)
        .or_else(|| block.txdata.iter().find(|tx| tx.compute_txid() == op.txid))
}

async fn resolve_start<C>(
    chain: &C,
    start: Option<ChainPosition>,
    tip: &ChainPosition,
) -> anyhow::Result<ChainPosition>
where
    C: HeaderSource + ?Sized,
{
    let mut start = start.unwrap_or_else(|| ChainPosition::from_height(0));

    if !start.has_zero_hash() {
        let found = chain
            .header_by_hash(start.hash)
            .await
            .with_context(|| format!("header_by_hash({})", start.hash))?;
        match found {
            Some((_, height)) => return Ok(ChainPosition::new(start.hash, height)),
            None => start.hash = BlockHash::all_zeros(),
        }
    }

    if start.height >= tip.height {
        return Ok(*tip);
    }
    if start.height != 0 {
        let found = chain
            .header_by_height(start.height)
            .await
            .with_context(|| format!("header_by_height({})", start.height))?;
        if let Some(header) = found {
            return Ok(ChainPosition::new(header.block_hash(), start.height));
        }
        log::warn!("start height {} unknown, scanning back to genesis", start.height);
    }

    // Only the height bounds the walk; the hash is informational.
    let genesis = chain
        .header_by_height(0)
        .await
        .context("header_by_height(0)")?
        .map(|h| h.block_hash())
        .unwrap_or_else(BlockHash::all_zeros);
    Ok(ChainPosition::new(genesis, 0))
}
