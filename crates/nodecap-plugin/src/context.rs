//! Per-operation cancellation and deadline.

use std::future::Future;
use std::time::Duration;

use nodecap_store::StoreResult;
use tokio::sync::watch;

use crate::error::{PluginError, PluginResult};

/// Carried by every plugin operation and applied to each store call.
///
/// Cancellation is signalled by sending `true` on the watch channel. Reads
/// race the signal and the timeout and are abandoned when either fires.
/// Writes are checked once before they start; a started write runs to the
/// end, since the blocking store task would commit it anyway, so an
/// operation never reports `Cancelled` or `Timeout` for a write that landed.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: Option<watch::Receiver<bool>>,
    timeout: Option<Duration>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Bound on each individual store call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Await a store read under this context.
    pub async fn run<T, F>(&self, call: F) -> PluginResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        if self.is_cancelled() {
            return Err(PluginError::Cancelled);
        }

        let mut cancel = self.cancel.clone();
        let guarded = async move {
            match cancel.as_mut() {
                Some(rx) => tokio::select! {
                    result = call => result.map_err(PluginError::from),
                    _ = cancelled(rx) => Err(PluginError::Cancelled),
                },
                None => call.await.map_err(PluginError::from),
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| PluginError::Timeout)?,
            None => guarded.await,
        }
    }

    /// Await a store write under this context. Only a context cancelled
    /// before the write starts stops it.
    pub async fn write<T, F>(&self, call: F) -> PluginResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        if self.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        Ok(call.await?)
    }
}

/// Resolves once `true` is observed. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
