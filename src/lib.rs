#![forbid(unsafe_code)]
#![deny(missing_docs)]
//! filter-rescan: a compact-filter (BIP-158) rescan and notification engine for wallets.
//!
//! ## What you implement
//! - [`HeaderSource`]: header lookup by hash and height, plus the synced tip.
//! - [`FilterSource`]: per-block basic/extended filters and raw blocks.
//! - [`BlockSubscriber`]: connect/disconnect notifications, fed through a
//!   [`BlockNotifier`].
//! - [`RescanHooks`]: whichever notifications you care about.
//! - [`Store`] (optional): where rescan progress is persisted.
//!
//! ## What the engine does
//! - Walks the chain from a start block, testing each block's **filters**
//!   against your watch set of addresses, outpoints and txids.
//! - On a hit, fetches the **block**, picks out relevant transactions, and
//!   starts watching outputs that pay your addresses.
//! - At the tip, follows **connect/disconnect** notifications, takes live
//!   watch-set **updates**, and rewinds on request.
//! - [`get_utxo`] scans backwards for the spend or creation of one output.
//!
//! ## Minimal usage
//! ```rust,ignore
//! use filter_rescan::prelude::*;
//! use std::sync::Arc;
//!
//! async fn run(chain: Arc<impl ChainSource + 'static>, addr: bitcoin::Address) -> anyhow::Result<()> {
//!     let (quit_tx, quit_rx) = tokio::sync::watch::channel(false);
//!     let opts = RescanOptions::builder()
//!         .start_block(ChainPosition::from_height(800_000))
//!         .watch_addrs([addr])
//!         .quit(quit_rx)
//!         .build()?;
//!
//!     let mut rescan = Rescan::new(chain, opts);
//!     let done = rescan.start()?;
//!     rescan.update(UpdateRequest::new().rewind(800_100)).await?;
//!
//!     quit_tx.send(true)?;
//!     done.await??;
//!     Ok(())
//! }
//! ```
/// Rescan state machine.
pub mod engine;

/// Typed errors for configuration and misuse.
pub mod error;

/// Traits and types for fetching filters and blocks.
pub mod filter_source;

/// Long-running rescan task handle.
pub mod handle;

/// Block header lookup abstraction (height ↔ hash).
pub mod headers;

/// Notification hooks.
pub mod hooks;

/// Rescan configuration and live updates.
pub mod options;

/// Chain positions.
pub mod position;

/// Persistence of rescan progress.
pub mod store;

/// Backend block notifications.
pub mod subscription;

/// Backward spend/creation scan for a single output.
pub mod utxo;

/// The watch set and filter-entry encodings.
pub mod watch;

// Internal helpers:
mod matcher;
mod relevance;

// Public re-exports
pub use engine::RescanEngine;
pub use error::RescanError;
pub use filter_source::{FilterSource, QueryOptions};
pub use handle::Rescan;
pub use headers::HeaderSource;
pub use hooks::{BlockDetails, NoopHooks, RescanHooks};
pub use options::{RescanOptions, RescanOptionsBuilder, UpdateRequest};
pub use position::ChainPosition;
#[cfg(feature = "store-sqlite")]
pub use store::SqliteStore;
pub use store::Store;
pub use subscription::{
    BlockNotification, BlockNotifier, BlockSubscriber, BlockSubscription, ChainSource,
};
pub use utxo::{get_utxo, SpendReport, UtxoQuery};
pub use watch::WatchSet;

/// Convenience prelude for end users.
pub mod prelude {
    pub use crate::{
        get_utxo, BlockDetails, BlockSubscriber, BlockSubscription, ChainPosition, ChainSource,
        FilterSource, HeaderSource, QueryOptions, Rescan, RescanEngine, RescanError, RescanHooks,
        RescanOptions, SpendReport, Store, UpdateRequest, UtxoQuery,
    };
}
