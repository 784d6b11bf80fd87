//! Legacy server list ping (opcode 0xFE), as sent by pre-netty clients.
//!
//! Three generations share the opcode:
//! - `FE`: bare ping, no payload
//! - `FE 01`: ping with a payload marker, no address
//! - `FE 01 FA <"MC|PingHost"> <u16 len> <u8 protocol> <host> <i32 port>`
//!
//! Strings are a big-endian i16 char count followed by UTF-16BE code units.

use tracing::{debug, trace};

use super::{ByteCursor, ReadError, SniffResult, Sniffer};
use crate::proxy::address::Address;

const PING_OPCODE: u8 = 0xFE;
const PAYLOAD_MARKER: u8 = 0x01;
const PLUGIN_MESSAGE: u8 = 0xFA;
const PING_HOST_CHANNEL: &str = "MC|PingHost";

/// Oldest protocol version that sends the PingHost payload.
const MIN_PING_HOST_PROTOCOL: u8 = 73;

/// Sniffer for the 0xFE legacy ping family.
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacySniffer;

impl Sniffer for LegacySniffer {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn sniff(&self, cursor: &mut ByteCursor<'_>) -> SniffResult {
        SniffResult::from_parse(parse(cursor))
    }
}

fn parse(cursor: &mut ByteCursor<'_>) -> Result<SniffResult, ReadError> {
    if cursor.read_u8()? != PING_OPCODE {
        return Err(ReadError::Malformed("not a legacy ping"));
    }

    if cursor.remaining() == 0 {
        trace!("Legacy ping without payload");
        return Ok(SniffResult::Accept(None));
    }

    if cursor.read_u8()? != PAYLOAD_MARKER {
        return Err(ReadError::Malformed("bad payload marker"));
    }

    if cursor.remaining() == 0 {
        trace!("Legacy ping with payload marker");
        return Ok(SniffResult::Accept(None));
    }

    if cursor.read_u8()? != PLUGIN_MESSAGE {
        return Err(ReadError::Malformed("expected plugin message"));
    }

    if read_utf16(cursor)? != PING_HOST_CHANNEL {
        return Err(ReadError::Malformed("unexpected plugin channel"));
    }

    let declared = usize::from(cursor.read_u16()?);
    if cursor.remaining() < declared {
        return Err(ReadError::Incomplete);
    }
    if cursor.remaining() > declared {
        return Err(ReadError::Malformed("trailing bytes after ping payload"));
    }

    let protocol = cursor.read_u8()?;
    if protocol < MIN_PING_HOST_PROTOCOL {
        return Err(ReadError::Malformed("protocol too old for PingHost"));
    }

    let hostname = read_utf16(cursor)?;
    let port = cursor.read_i32()?;
    let port = u16::try_from(port).map_err(|_| ReadError::Malformed("port out of range"))?;

    trace!(protocol, hostname = %hostname, port, "Parsed legacy PingHost");
    Ok(SniffResult::Accept(Address::new(hostname, Some(port)).ok()))
}

fn read_utf16(cursor: &mut ByteCursor<'_>) -> Result<String, ReadError> {
    let chars = cursor.read_i16()?;
    let chars =
        usize::try_from(chars).map_err(|_| ReadError::Malformed("negative string length"))?;
    let raw = cursor.read_bytes(chars * 2)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let s = String::from_utf16_lossy(&units);
    if s.contains(char::REPLACEMENT_CHARACTER) {
        debug!("Legacy ping string contained invalid UTF-16");
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{legacy_ping, utf16_string};
    use super::*;

    fn sniff(data: &[u8]) -> SniffResult {
        LegacySniffer.sniff(&mut ByteCursor::new(data))
    }

    #[test]
    fn test_bare_ping_accepts_without_address() {
        assert_eq!(sniff(&[0xFE]), SniffResult::Accept(None));
    }

    #[test]
    fn test_payload_marker_accepts_without_address() {
        assert_eq!(sniff(&[0xFE, 0x01]), SniffResult::Accept(None));
    }

    #[test]
    fn test_ping_host_accepts_with_address() {
        let packet = legacy_ping(78, "mc.example.com", 25565);
        assert_eq!(
            sniff(&packet),
            SniffResult::Accept(Some(Address::new("mc.example.com", Some(25565)).unwrap()))
        );
    }

    #[test]
    fn test_ping_host_truncated_is_incomplete() {
        let packet = legacy_ping(78, "mc.example.com", 25565);
        // Past the initial `FE 01`, every prefix must wait for more bytes.
        for cut in 3..packet.len() {
            assert_eq!(sniff(&packet[..cut]), SniffResult::Incomplete, "cut at {cut}");
        }
    }

    #[test]
    fn test_rejects_other_opcodes() {
        assert_eq!(sniff(&[0x10, 0x00]), SniffResult::Reject);
        assert_eq!(sniff(&[0xFE, 0x02]), SniffResult::Reject);
        assert_eq!(sniff(&[0xFE, 0x01, 0x00]), SniffResult::Reject);
    }

    #[test]
    fn test_rejects_wrong_channel() {
        let mut packet = vec![0xFE, 0x01, 0xFA];
        utf16_string("MC|Brand", &mut packet);
        packet.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(sniff(&packet), SniffResult::Reject);
    }

    #[test]
    fn test_rejects_old_protocol() {
        let packet = legacy_ping(72, "mc.example.com", 25565);
        assert_eq!(sniff(&packet), SniffResult::Reject);
    }

    #[test]
    fn test_rejects_bad_port() {
        assert_eq!(sniff(&legacy_ping(78, "mc.example.com", 70000)), SniffResult::Reject);
        assert_eq!(sniff(&legacy_ping(78, "mc.example.com", -1)), SniffResult::Reject);
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut packet = legacy_ping(78, "mc.example.com", 25565);
        packet.push(0x00);
        assert_eq!(sniff(&packet), SniffResult::Reject);
    }

    #[test]
    fn test_empty_input_incomplete() {
        assert_eq!(sniff(&[]), SniffResult::Incomplete);
    }
}
