//! Compact-filter matching shared by the rescan engine and `get_utxo`.
use anyhow::{anyhow, Context};
use bitcoin::{
    bip158::BlockFilter,
    consensus::encode::{self, VarInt},
    BlockHash,
};

use crate::filter_source::{FilterSource, QueryOptions};

/// Number of elements encoded in a raw filter, `None` if the prefix is unreadable.
pub fn filter_len(raw_filter: &[u8]) -> Option<u64> {
    encode::deserialize_partial::<VarInt>(raw_filter)
        .ok()
        .map(|(n, _)| n.0)
}

/// Test the watch entries against one raw GCS filter.
///
/// The siphash key is derived from `block_hash` inside `match_any`, so a
/// filter is only meaningful for the block it was built for. An absent,
/// empty, or zero-element filter never matches. A filter whose element
/// count cannot be decoded is an error.
pub fn filter_matches_any(
    block_hash: BlockHash,
    raw_filter: Option<&[u8]>,
    entries: &[Vec<u8>],
) -> anyhow::Result<bool> {
    let Some(raw) = raw_filter.filter(|raw| !raw.is_empty()) else {
        return Ok(false);
    };
    let n = filter_len(raw)
        .ok_or_else(|| anyhow!("filter for block {block_hash} has an unreadable element count"))?;
    if n == 0 || entries.is_empty() {
        return Ok(false);
    }

    let filter = BlockFilter::new(raw);
    let mut it = entries.iter().map(|v| v.as_slice());

    Ok(filter.match_any(&block_hash, &mut it)?)
}

/// Fetch and test a block's filters against `entries`.
///
/// The basic filter is always tried first. The extended filter is fetched
/// only when the basic one did not match and `consult_extended` is set
/// (the caller watches txids, which only the extended filter commits to).
pub async fn block_matches<F>(
    source: &F,
    block_hash: BlockHash,
    height: u32,
    entries: &[Vec<u8>],
    consult_extended: bool,
    opts: &QueryOptions,
) -> anyhow::Result<bool>
where
    F: FilterSource + ?Sized,
{
    let basic = source
        .get_basic_filter(block_hash, opts)
        .await
        .with_context(|| format!("get_basic_filter({block_hash}) @height {height}"))?;
    let mut matched = filter_matches_any(block_hash, basic.as_deref(), entries)
        .with_context(|| format!("basic filter match @height {height}"))?;

    if !matched && consult_extended {
        let extended = source
            .get_extended_filter(block_hash, opts)
            .await
            .with_context(|| format!("get_extended_filter({block_hash}) @height {height}"))?;
        matched = filter_matches_any(block_hash, extended.as_deref(), entries)
            .with_context(|| format!("extended filter match @height {height}"))?;
    }

    if matched {
        log::debug!("filter match for block {height} ({block_hash})");
    }
    Ok(matched)
}
