//! Network availability as seen by the orchestrator.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Shared online/offline flag.
///
/// Whoever knows about connectivity (the host app, a probe loop) flips it;
/// the orchestrator reads it when downloads are submitted. Jobs already
/// running are not affected.
#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            info!(online, "Network availability changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the network is online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_to_online() {
        assert!(NetworkMonitor::default().is_online());
    }

    #[test]
    fn test_clones_share_state() {
        let monitor = NetworkMonitor::default();
        let other = monitor.clone();
        other.set_online(false);
        assert!(!monitor.is_online());
        assert!(!*monitor.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_wait_online_resolves_after_reconnect() {
        let monitor = NetworkMonitor::new(false);
        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_online().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        monitor.set_online(true);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
