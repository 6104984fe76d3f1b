//! Deciding which transactions of a fetched block the wallet cares about.
use bitcoin::{Block, OutPoint, Transaction};

use crate::{
    hooks::{BlockDetails, RescanHooks},
    watch::{pushed_data, WatchSet},
};

/// Walk `block` and return the transactions relevant to `watch`, in block order.
///
/// Side effect: every output paying a watched address is added to `watch` as
/// an outpoint, so a later spend of it is caught without the caller asking.
/// `redeeming_spend` and `received_funds` fire at most once per transaction.
pub(crate) async fn relevant_txs(
    block: &Block,
    height: u32,
    watch: &mut WatchSet,
    hooks: &dyn RescanHooks,
) -> Vec<Transaction> {
    let base = BlockDetails {
        height,
        hash: block.block_hash().to_string(),
        time: i64::from(block.header.time),
        index: 0,
    };

    let mut relevant_txs = Vec::new();
    for (idx, tx) in block.txdata.iter().enumerate() {
        let details = BlockDetails {
            index: idx,
            ..base.clone()
        };
        let txid = tx.compute_txid();

        let mut relevant = watch.txids().contains(&txid);

        let spends_watched = tx
            .input
            .iter()
            .any(|txin| watch.outpoints().contains(&txin.previous_output));
        if spends_watched {
            relevant = true;
            hooks.redeeming_spend(tx, &details).await;
        }

        let mut received = false;
        for (vout, out) in tx.output.iter().enumerate() {
            let pays_watched = pushed_data(&out.script_pubkey)
                .iter()
                .any(|data| watch.address_data().contains(data));
            if !pays_watched {
                continue;
            }
            let op = OutPoint::new(txid, vout as u32);
            log::debug!("watching new output {op} at height {height}");
            watch.watch_outpoint(op);
            received = true;
        }
        if received {
            relevant = true;
            hooks.received_funds(tx, &details).await;
        }

        if relevant {
            relevant_txs.push(tx.clone());
        }
    }

    relevant_txs
}
