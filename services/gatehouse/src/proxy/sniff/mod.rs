//! Handshake sniffers.
//!
//! A sniffer inspects the bytes a client has sent so far and decides
//! whether they form one particular handshake variant. Sniffers are
//! stateless across connections; the per-connection candidate list lives
//! in the session.
//!
//! Each attempt runs over a [`ByteCursor`]. Sniffers only advance the
//! cursor; the caller resets it before the next sniffer runs, so every
//! sniffer sees the buffer from the first byte.

mod legacy;
mod modern;

use std::fmt;
use std::sync::Arc;

pub use legacy::LegacySniffer;
pub use modern::ModernSniffer;

use super::address::Address;

/// Outcome of one sniffing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    /// A complete handshake was parsed. Address-less legacy pings carry `None`.
    Accept(Option<Address>),
    /// The bytes can never be this handshake variant.
    Reject,
    /// Not enough bytes yet; retry once more arrive.
    Incomplete,
}

impl SniffResult {
    /// Collapse a parse attempt into a result: short reads retry, malformed
    /// input rejects.
    pub(crate) fn from_parse(result: Result<SniffResult, ReadError>) -> Self {
        match result {
            Ok(result) => result,
            Err(ReadError::Incomplete) => SniffResult::Incomplete,
            Err(ReadError::Malformed(_)) => SniffResult::Reject,
        }
    }
}

impl fmt::Display for SniffResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffResult::Accept(Some(address)) => write!(f, "accept({address})"),
            SniffResult::Accept(None) => f.write_str("accept(no address)"),
            SniffResult::Reject => f.write_str("reject"),
            SniffResult::Incomplete => f.write_str("incomplete"),
        }
    }
}

/// A handshake detection strategy.
pub trait Sniffer: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Attempt to recognise a handshake at the cursor position.
    fn sniff(&self, cursor: &mut ByteCursor<'_>) -> SniffResult;
}

/// Ordered list of sniffers consulted for every connection.
pub type SnifferChain = Vec<Arc<dyn Sniffer>>;

/// The standard chain: modern handshake first, then the legacy ping.
pub fn default_chain() -> SnifferChain {
    vec![Arc::new(ModernSniffer), Arc::new(LegacySniffer)]
}

/// Why a read from the cursor failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadError {
    /// Ran out of bytes.
    Incomplete,
    /// The bytes present are structurally invalid.
    Malformed(&'static str),
}

/// Maximum encoded length of a 32-bit VarInt.
const MAX_VARINT_BYTES: usize = 5;

/// Read-only cursor over the held bytes with a resettable position.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Rewind to the first byte.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < len {
            return Err(ReadError::Incomplete);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, ReadError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_i16(&mut self) -> Result<i16, ReadError> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32, ReadError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a little-endian base-128 VarInt of at most five bytes.
    pub(crate) fn read_varint(&mut self) -> Result<i32, ReadError> {
        let mut value: u32 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(ReadError::Malformed("VarInt too big"))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Encoders for building handshake fixtures.

    pub fn write_varint(mut value: i32, out: &mut Vec<u8>) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value = ((value as u32) >> 7) as i32;
            if value != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn modern_handshake(protocol: i32, hostname: &str, port: u16, next_state: i32) -> Vec<u8> {
        let mut body = Vec::new();
        write_varint(0x00, &mut body);
        write_varint(protocol, &mut body);
        write_varint(hostname.len() as i32, &mut body);
        body.extend_from_slice(hostname.as_bytes());
        body.extend_from_slice(&port.to_be_bytes());
        write_varint(next_state, &mut body);

        let mut packet = Vec::new();
        write_varint(body.len() as i32, &mut packet);
        packet.extend_from_slice(&body);
        packet
    }

    pub fn utf16_string(s: &str, out: &mut Vec<u8>) {
        let units: Vec<u16> = s.encode_utf16().collect();
        out.extend_from_slice(&(units.len() as i16).to_be_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_be_bytes());
        }
    }

    /// A 1.6-style legacy server list ping carrying a hostname and port.
    pub fn legacy_ping(protocol: u8, hostname: &str, port: i32) -> Vec<u8> {
        let mut tail = vec![protocol];
        utf16_string(hostname, &mut tail);
        tail.extend_from_slice(&port.to_be_bytes());

        let mut out = vec![0xFE, 0x01, 0xFA];
        utf16_string("MC|PingHost", &mut out);
        out.extend_from_slice(&(tail.len() as u16).to_be_bytes());
        out.extend_from_slice(&tail);
        out
    }
}
