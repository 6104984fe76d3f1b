//! Long-running rescan task with an updateable filter.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    engine::{PendingUpdate, RescanEngine},
    error::RescanError,
    options::{RescanOptions, UpdateRequest},
    subscription::ChainSource,
};

/// A rescan that runs on its own task and accepts watch-set updates while running.
///
/// ```rust,ignore
/// let mut rescan = Rescan::new(chain.clone(), opts);
/// let done = rescan.start()?;
/// rescan.update(UpdateRequest::new().add_addrs([addr]).rewind(100)).await?;
/// done.await??;
/// ```
pub struct Rescan<C: ?Sized> {
    chain: Arc<C>,
    running: Arc<AtomicBool>,
    update_tx: mpsc::Sender<PendingUpdate>,
    pending: Option<(RescanOptions, mpsc::Receiver<PendingUpdate>)>,
}

impl<C> Rescan<C>
where
    C: ChainSource + ?Sized + 'static,
{
    /// Prepare a rescan; nothing runs until [`Rescan::start`].
    pub fn new(chain: Arc<C>, opts: RescanOptions) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1);
        Self {
            chain,
            running: Arc::new(AtomicBool::new(true)),
            update_tx,
            pending: Some((opts, update_rx)),
        }
    }

    /// Spawn the rescan task. The returned channel yields its final result
    /// (`Ok(())` on a clean stop).
    ///
    /// # Errors
    /// [`RescanError::AlreadyStarted`] on a second call.
    pub fn start(&mut self) -> Result<oneshot::Receiver<anyhow::Result<()>>, RescanError> {
        let (opts, updates) = self.pending.take().ok_or(RescanError::AlreadyStarted)?;
        let engine = RescanEngine::with_updates(self.chain.clone(), opts, Some(updates));
        let running = self.running.clone();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let res = engine.run().await;
            running.store(false, Ordering::Release);
            if let Err(e) = &res {
                log::debug!("rescan terminated with error: {e:#}");
            }
            let _ = done_tx.send(res);
        });

        Ok(done_rx)
    }

    /// Hand an update to the running engine, waiting until it has been taken.
    ///
    /// # Errors
    /// [`RescanError::NotStarted`] before [`Rescan::start`];
    /// [`RescanError::Terminated`] if the rescan has already finished.
    pub async fn update(&self, request: UpdateRequest) -> Result<(), RescanError> {
        // Nothing drains the channel yet, so the ack could never arrive.
        if self.pending.is_some() {
            return Err(RescanError::NotStarted);
        }
        if !self.is_running() {
            return Err(RescanError::Terminated);
        }
        let (ack, taken) = oneshot::channel();
        self.update_tx
            .send(PendingUpdate { request, ack })
            .await
            .map_err(|_| RescanError::Terminated)?;
        taken.await.map_err(|_| RescanError::Terminated)
    }

    /// False once the rescan task has returned.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
