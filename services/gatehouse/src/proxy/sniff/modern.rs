//! Length-prefixed handshake (the "intention" packet every modern client
//! sends first).
//!
//! Frame layout:
//! - VarInt: packet length
//! - VarInt: packet id (0x00)
//! - VarInt: protocol version
//! - VarInt + UTF-8: server address (max 255 bytes)
//! - u16: server port
//! - VarInt: next state (1 = status, 2 = login, ...)

use tracing::{debug, trace};

use super::{ByteCursor, ReadError, SniffResult, Sniffer};
use crate::proxy::address::Address;

/// Packet id of the handshake packet.
const HANDSHAKE_PACKET_ID: i32 = 0x00;

/// Maximum server address length in bytes.
pub const MAX_HOSTNAME_BYTES: usize = 255;

/// Sniffer for the VarInt-framed handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModernSniffer;

impl Sniffer for ModernSniffer {
    fn name(&self) -> &'static str {
        "modern"
    }

    fn sniff(&self, cursor: &mut ByteCursor<'_>) -> SniffResult {
        SniffResult::from_parse(parse(cursor))
    }
}

fn parse(cursor: &mut ByteCursor<'_>) -> Result<SniffResult, ReadError> {
    let packet_len = cursor.read_varint()?;
    let packet_len =
        usize::try_from(packet_len).map_err(|_| ReadError::Malformed("negative packet length"))?;

    // Any short read, in the frame or inside its body, waits for more bytes.
    let body = cursor.read_bytes(packet_len)?;
    let mut body = ByteCursor::new(body);

    let result = parse_body(&mut body);

    if let Err(ReadError::Malformed(reason)) = &result {
        debug!(reason, "Rejecting modern handshake");
    }
    result
}

fn parse_body(body: &mut ByteCursor<'_>) -> Result<SniffResult, ReadError> {
    let packet_id = body.read_varint()?;
    if packet_id != HANDSHAKE_PACKET_ID {
        debug!(packet_id, "Unexpected packet id");
        return Err(ReadError::Malformed("unexpected packet id"));
    }

    let protocol = body.read_varint()?;

    let hostname_len = body.read_varint()?;
    let hostname_len = usize::try_from(hostname_len)
        .map_err(|_| ReadError::Malformed("negative hostname length"))?;
    if hostname_len > MAX_HOSTNAME_BYTES {
        return Err(ReadError::Malformed("hostname too long"));
    }
    let hostname = std::str::from_utf8(body.read_bytes(hostname_len)?)
        .map_err(|_| ReadError::Malformed("hostname is not UTF-8"))?;

    let port = body.read_u16()?;
    let next_state = body.read_varint()?;

    trace!(protocol, hostname, port, next_state, "Parsed modern handshake");

    // An empty server address still completes the handshake; it simply has
    // nothing to route on.
    Ok(SniffResult::Accept(Address::new(hostname, Some(port)).ok()))
}
