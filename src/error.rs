//! Typed errors for configuration and protocol misuse.
//!
//! Backend and decoding failures travel as plain [`anyhow::Error`] with
//! context attached; the variants here are the ones a caller may want to
//! match on (recover them with `err.downcast_ref::<RescanError>()`).
use bitcoin::BlockHash;
use thiserror::Error;

/// Errors raised by the rescan engine itself rather than by the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RescanError {
    /// Neither a resolvable end block nor a quit signal was supplied.
    #[error("rescan request must specify a quit signal or a valid end block")]
    MissingStopCondition,

    /// `get_utxo` requires exactly one outpoint.
    #[error("must pass exactly one outpoint, got {0}")]
    OutPointCount(usize),

    /// The rescan task has already finished and can no longer take updates.
    #[error("rescan is already done and cannot be updated")]
    Terminated,

    /// `update` was called before `start`.
    #[error("rescan has not been started")]
    NotStarted,

    /// `start` was called on a rescan that was already started.
    #[error("rescan was already started")]
    AlreadyStarted,

    /// A filter matched but the backend had no block for it.
    #[error("couldn't get block {height} ({hash}) from the network")]
    BlockNotFound {
        /// Height of the missing block.
        height: u32,
        /// Hash of the missing block.
        hash: BlockHash,
    },
}
