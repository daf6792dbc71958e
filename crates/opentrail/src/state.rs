use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::metrics::ConnectionStats;
use crate::service::LogService;
use crate::storage::Storage;

/// Shared application state (thread-safe).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub service: Arc<LogService>,
    pub storage: Arc<Storage>,
    pub connection_stats: ConnectionStats,
    /// Watch channel for shutdown signaling. Unlike broadcast, watch never
    /// loses the signal: receivers always see the latest value, even when
    /// they subscribe after the send.
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        config: Config,
        service: Arc<LogService>,
        storage: Arc<Storage>,
        connection_stats: ConnectionStats,
        shutdown_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            service,
            storage,
            connection_stats,
            shutdown_tx,
        }
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown to every component listening on the watch channel.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
