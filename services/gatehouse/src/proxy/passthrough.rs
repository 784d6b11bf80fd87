//! Pass-through consumers.
//!
//! When no route applies, the session releases the client connection along
//! with every byte it held. The consumer decides where that connection goes
//! next.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::address::Address;
use super::backend::BackendConnector;
use super::relay::{relay, RelayStats};

/// Receives connections the proxy does not route.
#[async_trait]
pub trait Passthrough: Send + Sync {
    /// Take over `client`. `held` must reach the new handler before any
    /// later client bytes.
    async fn release(&self, client: TcpStream, held: Bytes) -> io::Result<RelayStats>;
}

/// Forwards unrouted connections to a fixed fallback server.
#[derive(Debug, Clone)]
pub struct UpstreamPassthrough {
    target: Address,
    connector: BackendConnector,
}

impl UpstreamPassthrough {
    pub fn new(target: Address, connector: BackendConnector) -> Self {
        Self { target, connector }
    }
}

#[async_trait]
impl Passthrough for UpstreamPassthrough {
    async fn release(&self, client: TcpStream, held: Bytes) -> io::Result<RelayStats> {
        let mut upstream = self.connector.connect(&self.target).await?;
        upstream.write_all(&held).await?;
        debug!(
            upstream = %self.target,
            replayed = held.len(),
            "Released connection to fallback"
        );

        let mut stats = relay(client, upstream).await;
        stats.client_to_backend += held.len() as u64;
        Ok(stats)
    }
}

/// Drops unrouted connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosePassthrough;

#[async_trait]
impl Passthrough for ClosePassthrough {
    async fn release(&self, mut client: TcpStream, held: Bytes) -> io::Result<RelayStats> {
        info!(discarded = held.len(), "No fallback configured, closing connection");
        client.shutdown().await?;
        Ok(RelayStats::default())
    }
}
