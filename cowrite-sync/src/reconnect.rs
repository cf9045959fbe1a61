//! Reacts to transport connectivity changes.
//!
//! ```text
//! transport status (watch) ──► Connected          ──► connection_restored()  (re-run handshake)
//!                          ──► Disconnected/Error ──► connection_lost()      (state only)
//! ```
//!
//! Nothing is discarded on a drop: document, awareness and pending
//! local changes stay in memory until the handshake runs again.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::transport::ConnectionState;

/// Receiver of connectivity transitions.
#[async_trait]
pub trait ConnectionObserver: Send + Sync + 'static {
    /// The channel is usable again.
    async fn connection_restored(&self);

    /// The channel dropped or failed.
    async fn connection_lost(&self, state: ConnectionState);
}

/// Background watcher forwarding transport status to an observer.
///
/// Only transitions after [`spawn`](Self::spawn) are reported; the value
/// current at spawn time is treated as already handled. Dropping the
/// controller stops it.
pub struct ReconnectionController {
    handle: JoinHandle<()>,
}

impl ReconnectionController {
    pub fn spawn<O: ConnectionObserver>(
        mut status: watch::Receiver<ConnectionState>,
        observer: Arc<O>,
    ) -> Self {
        status.borrow_and_update();

        let handle = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let state = *status.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        log::info!("Transport reconnected, resynchronizing");
                        observer.connection_restored().await;
                    }
                    ConnectionState::Disconnected | ConnectionState::Error => {
                        log::warn!("Transport connection lost ({state:?})");
                        observer.connection_lost(state).await;
                    }
                    ConnectionState::Connecting => {
                        log::debug!("Transport reconnecting");
                    }
                }
            }
            log::debug!("Transport status channel closed");
        });

        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
