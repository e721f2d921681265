//! Graceful-shutdown coordination between the accept loop and live viewers.
//!
//! Connection handlers hold a [`ClientGuard`] while running and watch
//! [`ShutdownCoordinator::token`]. On shutdown the server flips the signal,
//! waits for the guard count to reach zero (with its own deadline), then
//! exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Inner {
    active: AtomicUsize,
    all_closed: Notify,
    signal: CancellationToken,
}

/// Shared shutdown state. Cloneable; all clones observe the same signal.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of one live connection.
pub struct ClientGuard {
    inner: Arc<Inner>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.all_closed.notify_waiters();
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                active: AtomicUsize::new(0),
                all_closed: Notify::new(),
                signal: CancellationToken::new(),
            }),
        }
    }

    /// Register a connection; drop the guard when it closes.
    pub fn client_guard(&self) -> ClientGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        ClientGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Token that connection loops select on to exit promptly.
    pub fn token(&self) -> CancellationToken {
        self.inner.signal.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.signal.is_cancelled()
    }

    /// Begin shutdown: all connection loops are asked to stop.
    pub fn shutdown(&self) {
        self.inner.signal.cancel();
    }

    /// Wait until every registered connection has closed.
    pub async fn wait_for_all_closed(&self) {
        loop {
            if self.inner.active.load(Ordering::Acquire) == 0 {
                return;
            }
            self.inner.all_closed.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn guards_track_active_count() {
        let coord = ShutdownCoordinator::new();
        assert_eq!(coord.active_count(), 0);
        let g1 = coord.client_guard();
        let g2 = coord.client_guard();
        assert_eq!(coord.active_count(), 2);
        drop(g1);
        assert_eq!(coord.active_count(), 1);
        drop(g2);
        assert_eq!(coord.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_signals_token() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        assert!(coord.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should be cancelled");
    }

    #[tokio::test]
    async fn wait_for_all_closed_unblocks_on_last_drop() {
        let coord = ShutdownCoordinator::new();
        let guard = coord.client_guard();
        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.wait_for_all_closed().await })
        };
        tokio::task::yield_now().await;
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_with_no_clients_returns_immediately() {
        let coord = ShutdownCoordinator::new();
        tokio::time::timeout(Duration::from_millis(100), coord.wait_for_all_closed())
            .await
            .expect("no clients, no waiting");
    }
}
