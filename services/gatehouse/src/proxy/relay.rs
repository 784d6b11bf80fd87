//! Bidirectional byte relay.
//!
//! Each direction reads a chunk, writes it fully to the other side and only
//! then reads again, so a slow reader throttles its source. When either
//! direction ends (EOF or error) it shuts down its destination's write half
//! and tells the opposite direction to stop, which in turn flushes and shuts
//! down its own destination. Both sockets are therefore closed once either
//! side goes away.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Read buffer per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay between `client` and `backend` until both directions are done.
pub async fn relay<C, B>(client: C, backend: B) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let stop_upstream = Notify::new();
    let stop_downstream = Notify::new();

    let upstream = forward(
        "client_to_backend",
        client_read,
        backend_write,
        &stop_upstream,
        &stop_downstream,
    );
    let downstream = forward(
        "backend_to_client",
        backend_read,
        client_write,
        &stop_downstream,
        &stop_upstream,
    );

    let (client_to_backend, backend_to_client) = tokio::join!(upstream, downstream);

    RelayStats {
        client_to_backend,
        backend_to_client,
    }
}

/// Copy `reader` into `writer` until EOF, error or a stop signal.
async fn forward<R, W>(
    direction: &'static str,
    mut reader: R,
    mut writer: W,
    stop: &Notify,
    peer: &Notify,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    log_transport_error(direction, "read", &e);
                    break;
                }
            },
            _ = stop.notified() => break,
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            log_transport_error(direction, "write", &e);
            break;
        }
        total += n as u64;
    }

    if let Err(e) = writer.shutdown().await {
        log_transport_error(direction, "shutdown", &e);
    }
    peer.notify_one();

    debug!(direction, bytes = total, "Relay direction finished");
    total
}

/// Peer resets are ordinary disconnects; anything else is worth a warning.
fn log_transport_error(direction: &'static str, op: &'static str, e: &io::Error) {
    if is_disconnect(e) {
        debug!(direction, op, error = %e, "Peer disconnected");
    } else {
        warn!(direction, op, error = %e, "Relay transport error");
    }
}

pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
