//! Per-connection driver.
//!
//! Reads client bytes into a [`Session`] until it reaches a verdict, then
//! carries it out:
//! - `Forward`: dial the backend while still holding client bytes, write an
//!   optional PROXY header, replay the held bytes, relay
//! - `Release`: hand the client and its held bytes to the pass-through
//!   consumer
//!
//! All failures are local to the connection and surface as
//! [`ConnectionError`]; the listener counts and logs them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::address::Address;
use super::backend::Dialer;
use super::passthrough::Passthrough;
use super::proxy_protocol::{self, Decoded, HeaderError, ProxyHeader};
use super::relay::{relay, RelayStats};
use super::router::{ProxyProtocol, RouteResult, Router};
use super::session::{Session, SessionError, Verdict, HOLD_BUFFER_CAP};
use super::sniff::{default_chain, SnifferChain};

/// Default time a client has to complete its handshake.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of each client read before routing.
const SNIFF_READ_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("no routing decision within {0:?}")]
    SniffTimeout(Duration),

    #[error("client closed the connection before routing finished")]
    ClientClosed,

    #[error("invalid inbound PROXY header: {0}")]
    InboundHeader(#[source] HeaderError),

    #[error("failed to connect to backend {target}: {source}")]
    BackendConnect {
        target: Address,
        #[source]
        source: io::Error,
    },

    #[error("cannot build PROXY header: {0}")]
    OutboundHeader(#[source] HeaderError),

    #[error("pass-through failed: {0}")]
    Passthrough(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Relayed to a routed backend.
    Routed {
        route_id: String,
        backend: Address,
        stats: RelayStats,
    },
    /// Handed to the pass-through consumer.
    Released { stats: RelayStats },
}

/// Drives client connections through sniffing, routing and relaying.
pub struct ConnectionHandler {
    router: Arc<Router>,
    sniffers: SnifferChain,
    dialer: Arc<dyn Dialer>,
    passthrough: Arc<dyn Passthrough>,
    sniff_timeout: Duration,
    accept_proxy_protocol: bool,
}

impl ConnectionHandler {
    pub fn new(
        router: Arc<Router>,
        dialer: Arc<dyn Dialer>,
        passthrough: Arc<dyn Passthrough>,
    ) -> Self {
        Self {
            router,
            sniffers: default_chain(),
            dialer,
            passthrough,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            accept_proxy_protocol: false,
        }
    }

    pub fn with_sniff_timeout(mut self, sniff_timeout: Duration) -> Self {
        self.sniff_timeout = sniff_timeout;
        self
    }

    /// Expect every client stream to begin with a PROXY v1/v2 header.
    pub fn with_inbound_proxy_protocol(mut self, enabled: bool) -> Self {
        self.accept_proxy_protocol = enabled;
        self
    }

    /// Handle one accepted client connection to completion.
    pub async fn handle(
        &self,
        mut client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Outcome, ConnectionError> {
        let deadline = Instant::now() + self.sniff_timeout;

        let (client_addr, initial) = if self.accept_proxy_protocol {
            self.read_proxy_header(&mut client, peer_addr, deadline).await?
        } else {
            (peer_addr, Bytes::new())
        };
        if client_addr != peer_addr {
            debug!(client_addr = %client_addr, "Real client address from PROXY header");
        }

        if !self.router.table().is_enabled() {
            debug!("Routing disabled, passing connection through");
            return self.release(client, initial).await;
        }

        let mut session = Session::new(Arc::clone(&self.router), self.sniffers.clone());
        let mut buf = [0u8; SNIFF_READ_SIZE];

        let mut verdict = if initial.is_empty() {
            Verdict::NeedMore
        } else {
            session.feed(&initial).await?
        };
        loop {
            match verdict {
                Verdict::NeedMore => {
                    let n = self.read_chunk(&mut client, &mut buf, deadline).await?;
                    verdict = session.feed(&buf[..n]).await?;
                }
                Verdict::Release(held) => return self.release(client, held).await,
                Verdict::Forward(result) => {
                    return self.forward(client, client_addr, session, result).await
                }
            }
        }
    }

    async fn release(&self, client: TcpStream, held: Bytes) -> Result<Outcome, ConnectionError> {
        let stats = self
            .passthrough
            .release(client, held)
            .await
            .map_err(ConnectionError::Passthrough)?;
        Ok(Outcome::Released { stats })
    }

    async fn forward(
        &self,
        mut client: TcpStream,
        client_addr: SocketAddr,
        mut session: Session,
        result: RouteResult,
    ) -> Result<Outcome, ConnectionError> {
        let target = result.address;
        let route = result.route;

        let mut buf = [0u8; SNIFF_READ_SIZE];
        let mut client_open = true;

        // Keep holding client bytes while the dial is in flight.
        let dialed = {
            let dial = self.dialer.dial(&target);
            tokio::pin!(dial);
            loop {
                tokio::select! {
                    biased;
                    dialed = &mut dial => break dialed,
                    read = client.read(&mut buf), if client_open => match read? {
                        0 => client_open = false,
                        n => session.hold(&buf[..n])?,
                    },
                }
            }
        };

        let mut backend = dialed.map_err(|source| ConnectionError::BackendConnect {
            target: target.clone(),
            source,
        })?;

        if !client_open {
            debug!(backend_addr = %target, "Client left during dial, closing backend");
            return Err(ConnectionError::ClientClosed);
        }

        if let ProxyProtocol::On(version) = route.proxy_protocol {
            let backend_addr = backend.peer_addr()?;
            let header = ProxyHeader::new(version, client_addr, backend_addr)
                .encode()
                .map_err(ConnectionError::OutboundHeader)?;
            backend.write_all(&header).await?;
            debug!(version = ?version, "PROXY header sent");
        }

        let held = session.into_held();
        backend.write_all(&held).await?;

        info!(
            route_id = %route.id,
            backend_addr = %target,
            replayed = held.len(),
            "Forwarding connection"
        );

        let mut stats = relay(client, backend).await;
        stats.client_to_backend += held.len() as u64;

        Ok(Outcome::Routed {
            route_id: route.id,
            backend: target,
            stats,
        })
    }

    /// Consume an inbound PROXY header, returning the real client address
    /// and any application bytes that followed it.
    async fn read_proxy_header(
        &self,
        client: &mut TcpStream,
        peer_addr: SocketAddr,
        deadline: Instant,
    ) -> Result<(SocketAddr, Bytes), ConnectionError> {
        let mut pending = BytesMut::with_capacity(SNIFF_READ_SIZE);
        let mut buf = [0u8; SNIFF_READ_SIZE];

        loop {
            if let Decoded::Header { source, consumed } =
                proxy_protocol::decode(&pending).map_err(ConnectionError::InboundHeader)?
            {
                pending.advance(consumed);
                return Ok((source.unwrap_or(peer_addr), pending.freeze()));
            }

            if pending.len() >= HOLD_BUFFER_CAP {
                return Err(SessionError::HoldOverflow {
                    held: pending.len(),
                    incoming: 0,
                    cap: HOLD_BUFFER_CAP,
                }
                .into());
            }

            let n = self.read_chunk(client, &mut buf, deadline).await?;
            pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn read_chunk(
        &self,
        client: &mut TcpStream,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<usize, ConnectionError> {
        match timeout_at(deadline, client.read(buf)).await {
            Err(_) => Err(ConnectionError::SniffTimeout(self.sniff_timeout)),
            Ok(Ok(0)) => Err(ConnectionError::ClientClosed),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}
