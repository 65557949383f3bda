//! Orchestrator-wide teardown state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tracing::debug;

use super::PluginClient;
use crate::mux::lock;

/// Tracks whether orchestrator shutdown has begun, and which plugin clients
/// it must kill.
///
/// One instance is shared by every [`PluginClient`] of a process.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    shutting_down: AtomicBool,
    managed: Mutex<Vec<Arc<PluginClient>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark shutdown as started. Transport failures after this point are
    /// expected.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Add a client to the set killed by [`kill_all`](Self::kill_all).
    pub fn register(&self, client: Arc<PluginClient>) {
        lock(&self.managed).push(client);
    }

    pub fn managed_count(&self) -> usize {
        lock(&self.managed).len()
    }

    /// Begin shutdown, then kill every managed client in parallel and wait
    /// until all of them have finished logging.
    ///
    /// Shutdown is flagged first so that calls failing because of these
    /// kills are treated as expected.
    pub async fn kill_all(&self) {
        self.begin_shutdown();
        let clients = std::mem::take(&mut *lock(&self.managed));
        debug!(count = clients.len(), "killing managed plugins");
        join_all(clients.iter().map(|client| client.kill())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PluginClientConfig;

    #[test]
    fn test_begin_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());
        coordinator.begin_shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_kill_all_drains_registry() {
        let coordinator = ShutdownCoordinator::new();
        let config = PluginClientConfig::new("never-started").managed(true);
        let _client = PluginClient::new(config, coordinator.clone());
        assert_eq!(coordinator.managed_count(), 1);

        coordinator.kill_all().await;
        assert!(coordinator.is_shutting_down());
        assert_eq!(coordinator.managed_count(), 0);
    }
}
