//! TCP ingestion server.
//!
//! Newline-framed UTF-8 messages, one connection handler task per client.
//! The accept loop selects on the shutdown watch channel so shutdown is
//! prompt; per-connection reads are deadline-gated. Lines longer than
//! `max_line_length` (64 KiB by default) are discarded up to the next
//! newline. The server never replies on these sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::metrics::ConnectionStats;
use crate::service::LogService;

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub read_timeout: Duration,
    /// Kept for config parity; ingestion sockets are never written to, so
    /// this only bounds the close path.
    pub write_timeout: Duration,
    pub max_line_length: usize,
}

impl TcpServerConfig {
    pub fn new(port: u16, max_connections: usize) -> Self {
        Self {
            port,
            max_connections,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            max_line_length: 64 * 1024,
        }
    }
}

pub struct TcpServer {
    config: TcpServerConfig,
    listener: TcpListener,
    service: Arc<LogService>,
    stats: ConnectionStats,
}

impl TcpServer {
    pub async fn bind(
        config: TcpServerConfig,
        service: Arc<LogService>,
        stats: ConnectionStats,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        info!(addr = %listener.local_addr()?, "TCP ingestion server listening");
        Ok(Self {
            config,
            listener,
            service,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown, then wait (bounded) for handler tasks to
    /// finish. Connections past `max_connections` are closed immediately
    /// and counted as connection errors.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            if self.stats.active_connections() >= self.config.max_connections as u64 {
                                self.stats.connection_rejected();
                                warn!(%peer, limit = self.config.max_connections,
                                    "connection limit reached, closing");
                                drop(socket);
                                continue;
                            }
                            self.stats.connection_opened();
                            let service = self.service.clone();
                            let stats = self.stats.clone();
                            let shutdown = shutdown.clone();
                            let read_timeout = self.config.read_timeout;
                            let max_line = self.config.max_line_length;
                            tracker.spawn(async move {
                                handle_connection(socket, peer, service, shutdown, read_timeout, max_line).await;
                                stats.connection_closed();
                            });
                        }
                        Err(e) => {
                            warn!("accept failed: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("TCP server stopped accepting, waiting for connection handlers");
        tracker.close();
        if timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
            warn!("connection handlers did not finish within 5s");
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    service: Arc<LogService>,
    mut shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
    max_line: usize,
) {
    debug!(%peer, "connection opened");
    let mut framed = FramedRead::new(socket, LinesCodec::new_with_max_length(max_line));

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = timeout(read_timeout, framed.next()) => match next {
                // Read deadline exceeded; only this connection is affected.
                Err(_) => {
                    debug!(%peer, "read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(line))) => {
                    if line.is_empty() {
                        continue;
                    }
                    // Processing failures never close the connection.
                    if let Err(e) = service.process_log(line) {
                        warn!(%peer, "dropping line: {}", e);
                    }
                }
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    // The codec discards up to the next newline and recovers.
                    warn!(%peer, max_line, "oversized line discarded");
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => {
                    debug!(%peer, "read error: {}", e);
                    break;
                }
            }
        }
    }

    debug!(%peer, "connection closed");
}
