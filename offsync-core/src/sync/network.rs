//! Connectivity gate
//!
//! Deferred work only runs while the host reports a usable network. The
//! platform glue (or the CLI) flips the flag; tasks wait on it.

use tokio::sync::watch;

/// Shared online/offline flag.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                tracing::info!(online, "Network state changed");
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the network is up. Returns immediately when online.
    pub async fn wait_online(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
