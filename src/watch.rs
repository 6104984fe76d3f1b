//! Watch set: what the rescan is looking for, plus the byte strings that are
//! fed to the compact filters.
use bitcoin::{consensus, hashes::Hash, script::Instruction, Address, OutPoint, Script, Txid};

/// Filter entry for an outpoint: its 36-byte consensus encoding
/// (txid in internal byte order followed by the little-endian vout).
pub fn outpoint_filter_entry(op: &OutPoint) -> Vec<u8> {
    consensus::serialize(op)
}

/// Non-empty pushes of a script. Output classification compares these
/// against the pushes of each watched address's script.
pub fn pushed_data(script: &Script) -> Vec<Vec<u8>> {
    script
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(pb)) if !pb.as_bytes().is_empty() => {
                Some(pb.as_bytes().to_vec())
            }
            _ => None,
        })
        .collect()
}

/// Append-only collection of watched items.
///
/// `entries` holds every filter entry in insertion order; the typed vectors
/// are kept alongside for post-match classification of transactions.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    addrs: Vec<Address>,
    addr_data: Vec<Vec<u8>>,
    outpoints: Vec<OutPoint>,
    txids: Vec<Txid>,
    entries: Vec<Vec<u8>>,
}

impl WatchSet {
    /// Empty watch set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append addresses, outpoints and txids. No dedup is performed.
    pub fn add_watch(&mut self, addrs: &[Address], outpoints: &[OutPoint], txids: &[Txid]) {
        let before = self.entries.len();
        for addr in addrs {
            let script = addr.script_pubkey();
            self.addr_data.extend(pushed_data(&script));
            self.entries.push(script.into_bytes());
            self.addrs.push(addr.clone());
        }
        for op in outpoints {
            self.watch_outpoint(*op);
        }
        for txid in txids {
            self.entries.push(txid.as_byte_array().to_vec());
            self.txids.push(*txid);
        }
        if log::log_enabled!(log::Level::Trace) {
            for entry in &self.entries[before..] {
                log::trace!("watching filter entry {}", hex::encode(entry));
            }
        }
    }

    /// Start watching a single outpoint for spends.
    pub fn watch_outpoint(&mut self, op: OutPoint) {
        self.entries.push(outpoint_filter_entry(&op));
        self.outpoints.push(op);
    }

    /// All filter entries collected so far.
    pub fn filter_entries(&self) -> &[Vec<u8>] {
        &self.entries
    }

    /// Watched addresses.
    pub fn addrs(&self) -> &[Address] {
        &self.addrs
    }

    /// Pushed data of every watched address script.
    pub fn address_data(&self) -> &[Vec<u8>] {
        &self.addr_data
    }

    /// Watched outpoints, including ones registered after a receive.
    pub fn outpoints(&self) -> &[OutPoint] {
        &self.outpoints
    }

    /// Watched transaction ids.
    pub fn txids(&self) -> &[Txid] {
        &self.txids
    }

    /// Whether any txids are watched (decides if the extended filter is worth fetching).
    pub fn has_txids(&self) -> bool {
        !self.txids.is_empty()
    }

    /// True if nothing is watched at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
