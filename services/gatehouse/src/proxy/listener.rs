//! TCP listener and connection accounting.
//!
//! This module accepts client connections and hands each one to a
//! [`ConnectionHandler`] in its own task:
//! - Concurrency is capped by a semaphore; excess connections are dropped
//! - Every connection runs inside a `connection` tracing span
//! - Outcomes and failures are tallied in [`ListenerStats`]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{ConnectionError, ConnectionHandler, Outcome};
use super::relay::RelayStats;
use super::session::SessionError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections forwarded to a routed backend.
    pub connections_routed: AtomicU64,
    /// Connections handed to pass-through.
    pub connections_released: AtomicU64,
    /// Connections closed for exceeding the hold buffer.
    pub hold_overflows: AtomicU64,
    /// Clients that never finished their handshake in time.
    pub sniff_timeouts: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client to backend (including replayed bytes).
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_relay(&self, stats: &RelayStats) {
        self.bytes_to_backend
            .fetch_add(stats.client_to_backend, Ordering::Relaxed);
        self.bytes_from_backend
            .fetch_add(stats.backend_to_client, Ordering::Relaxed);
    }

    fn record(&self, result: &Result<Outcome, ConnectionError>) {
        match result {
            Ok(Outcome::Routed { stats, .. }) => {
                self.connections_routed.fetch_add(1, Ordering::Relaxed);
                self.record_relay(stats);
            }
            Ok(Outcome::Released { stats }) => {
                self.connections_released.fetch_add(1, Ordering::Relaxed);
                self.record_relay(stats);
            }
            Err(ConnectionError::Session(SessionError::HoldOverflow { .. })) => {
                self.hold_overflows.fetch_add(1, Ordering::Relaxed);
            }
            Err(ConnectionError::SniffTimeout(_)) => {
                self.sniff_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(ConnectionError::BackendConnect { .. }) => {
                self.backend_failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }
}

/// A TCP listener for the handshake proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Per-connection driver.
    handler: Arc<ConnectionHandler>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, handler: Arc<ConnectionHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            handler,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the statistics, usable after `run` takes the listener.
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let handler = Arc::clone(&self.handler);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            let result = handler.handle(stream, peer_addr).await;
                            stats.record(&result);
                            log_result(&result);

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

fn log_result(result: &Result<Outcome, ConnectionError>) {
    match result {
        Ok(Outcome::Routed {
            route_id,
            backend,
            stats,
        }) => debug!(
            route_id = %route_id,
            backend_addr = %backend,
            bytes_to_backend = stats.client_to_backend,
            bytes_from_backend = stats.backend_to_client,
            "Connection closed"
        ),
        Ok(Outcome::Released { stats }) => debug!(
            bytes_to_backend = stats.client_to_backend,
            bytes_from_backend = stats.backend_to_client,
            "Pass-through connection closed"
        ),
        Err(ConnectionError::ClientClosed) => debug!("Client closed before routing"),
        Err(
            e @ (ConnectionError::Session(_)
            | ConnectionError::SniffTimeout(_)
            | ConnectionError::InboundHeader(_)),
        ) => debug!(error = %e, "Connection dropped"),
        Err(e) => warn!(error = %e, "Connection failed"),
    }
}
