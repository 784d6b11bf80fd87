//! Backend connection establishment.
//!
//! Targets are `hostname:port` pairs; hostnames go through the system
//! resolver via `TcpStream::connect`. There is no retry: a failed dial
//! closes the client connection.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::address::Address;
use super::router::DEFAULT_GAME_PORT;

/// Opens connections to routed backends.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &Address) -> io::Result<TcpStream>;
}

/// Dials backends with an optional connect timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendConnector {
    /// `None` leaves the timeout to the transport.
    connect_timeout: Option<Duration>,
}

impl BackendConnector {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    /// Open a TCP connection to `target`.
    pub async fn connect(&self, target: &Address) -> io::Result<TcpStream> {
        let host = target.hostname();
        let port = target.port().unwrap_or(DEFAULT_GAME_PORT);
        debug!(backend_addr = %target, "Connecting to backend");

        let stream = match self.connect_timeout {
            Some(limit) => match timeout(limit, TcpStream::connect((host, port))).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connect timeout",
                    ))
                }
            },
            None => TcpStream::connect((host, port)).await?,
        };

        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for BackendConnector {
    async fn dial(&self, target: &Address) -> io::Result<TcpStream> {
        self.connect(target).await
    }
}
