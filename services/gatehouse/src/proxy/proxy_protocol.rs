//! PROXY protocol header generation and decoding.
//!
//! Outbound, a header is prepended to a backend connection when the matched
//! route asks for it, so the backend learns the real client address.
//! Inbound, a header sent by a load balancer in front of gatehouse is
//! decoded so that real client address can be propagated further.
//!
//! v1 wire format (text):
//! - `PROXY TCP4|TCP6 <src ip> <dst ip> <src port> <dst port>\r\n`
//!
//! v2 wire format (binary):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports (then optional TLVs)

use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// PROXY protocol v2 signature (12 bytes).
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// v1 header prefix.
const PROXY_V1_PREFIX: &[u8] = b"PROXY ";

/// Maximum v1 header length including CRLF.
const PROXY_V1_MAX_LEN: usize = 107;

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command (health checks from the balancer itself).
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

/// Fixed part of a v2 header (signature + ver/cmd + fam + len).
const V2_FIXED_LEN: usize = 16;

/// Errors building or decoding a PROXY header.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// Client and backend addresses are of different IP families.
    #[error("mixed address families: client {src}, backend {dst}")]
    MixedFamily { src: SocketAddr, dst: SocketAddr },

    /// Unsupported protocol version in configuration.
    #[error("unsupported PROXY protocol version {0} (expected 1 or 2)")]
    UnsupportedVersion(u8),

    /// Inbound bytes do not start with a PROXY header.
    #[error("connection does not start with a PROXY protocol header")]
    NotProxy,

    /// Inbound PROXY header is malformed.
    #[error("malformed PROXY protocol header: {0}")]
    Malformed(&'static str),

    /// Writing the header failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// PROXY protocol version selected per route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocolVersion {
    /// Human-readable text header.
    V1,
    /// Compact binary header.
    V2,
}

impl TryFrom<u8> for ProxyProtocolVersion {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(HeaderError::UnsupportedVersion(other)),
        }
    }
}

/// PROXY protocol header generator.
#[derive(Debug, Clone)]
pub struct ProxyHeader {
    pub version: ProxyProtocolVersion,
    /// Source (client) address.
    pub src_addr: SocketAddr,
    /// Destination (backend) address.
    pub dst_addr: SocketAddr,
}

impl ProxyHeader {
    /// Create a new header for the given connection.
    ///
    /// # Arguments
    /// * `src_addr` - Original client source address and port
    /// * `dst_addr` - Backend address the proxy connected to
    pub fn new(version: ProxyProtocolVersion, src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            version,
            src_addr,
            dst_addr,
        }
    }

    /// Generate the header bytes.
    ///
    /// Both addresses must be of the same IP family (IPv4-mapped IPv6
    /// addresses count as IPv4). A mixed pairing has no unambiguous
    /// encoding and is an error.
    pub fn encode(&self) -> Result<Vec<u8>, HeaderError> {
        let src_ip = canonical_ip(self.src_addr.ip());
        let dst_ip = canonical_ip(self.dst_addr.ip());

        match (src_ip, dst_ip) {
            (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => match self.version {
                ProxyProtocolVersion::V1 => self.encode_v1("TCP4", src_ip.into(), dst_ip.into()),
                ProxyProtocolVersion::V2 => self.encode_v2_inet(src_ip, dst_ip),
            },
            (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => match self.version {
                ProxyProtocolVersion::V1 => self.encode_v1("TCP6", src_ip.into(), dst_ip.into()),
                ProxyProtocolVersion::V2 => self.encode_v2_inet6(src_ip, dst_ip),
            },
            _ => Err(HeaderError::MixedFamily {
                src: self.src_addr,
                dst: self.dst_addr,
            }),
        }
    }

    fn encode_v1(&self, family: &str, src_ip: IpAddr, dst_ip: IpAddr) -> Result<Vec<u8>, HeaderError> {
        let line = format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            src_ip,
            dst_ip,
            self.src_addr.port(),
            self.dst_addr.port()
        );
        Ok(line.into_bytes())
    }

    /// Encode IPv4 PROXY v2 header.
    fn encode_v2_inet(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Result<Vec<u8>, HeaderError> {
        let mut buf = Vec::with_capacity(V2_FIXED_LEN + IPV4_ADDR_LEN as usize);

        buf.write_all(&PROXY_V2_SIGNATURE)?;
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET | TRANSPORT_STREAM);
        buf.write_all(&IPV4_ADDR_LEN.to_be_bytes())?;
        buf.write_all(&src_ip.octets())?;
        buf.write_all(&dst_ip.octets())?;
        buf.write_all(&self.src_addr.port().to_be_bytes())?;
        buf.write_all(&self.dst_addr.port().to_be_bytes())?;

        Ok(buf)
    }

    /// Encode IPv6 PROXY v2 header.
    fn encode_v2_inet6(&self, src_ip: Ipv6Addr, dst_ip: Ipv6Addr) -> Result<Vec<u8>, HeaderError> {
        let mut buf = Vec::with_capacity(V2_FIXED_LEN + IPV6_ADDR_LEN as usize);

        buf.write_all(&PROXY_V2_SIGNATURE)?;
        buf.push(VERSION_COMMAND_PROXY);
        buf.push(AF_INET6 | TRANSPORT_STREAM);
        buf.write_all(&IPV6_ADDR_LEN.to_be_bytes())?;
        buf.write_all(&src_ip.octets())?;
        buf.write_all(&dst_ip.octets())?;
        buf.write_all(&self.src_addr.port().to_be_bytes())?;
        buf.write_all(&self.dst_addr.port().to_be_bytes())?;

        Ok(buf)
    }
}

/// Unwrap IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`), as reported by
/// dual-stack sockets for IPv4 peers.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Result of decoding an inbound header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// More bytes are needed to finish the header.
    Incomplete,
    /// A full header was decoded.
    Header {
        /// Real client address, if the header carried one.
        source: Option<SocketAddr>,
        /// Header length in bytes; application data starts after it.
        consumed: usize,
    },
}

/// Decode a PROXY v1 or v2 header at the start of `data`.
pub fn decode(data: &[u8]) -> Result<Decoded, HeaderError> {
    if is_prefix_of(data, &PROXY_V2_SIGNATURE) {
        if data.len() < PROXY_V2_SIGNATURE.len() {
            return Ok(Decoded::Incomplete);
        }
        return decode_v2(data);
    }
    if is_prefix_of(data, PROXY_V1_PREFIX) {
        if data.len() < PROXY_V1_PREFIX.len() {
            return Ok(Decoded::Incomplete);
        }
        return decode_v1(data);
    }
    Err(HeaderError::NotProxy)
}

/// True if `data` and `expected` agree on their common prefix.
fn is_prefix_of(data: &[u8], expected: &[u8]) -> bool {
    let n = data.len().min(expected.len());
    data[..n] == expected[..n]
}

fn decode_v1(data: &[u8]) -> Result<Decoded, HeaderError> {
    let window = &data[..data.len().min(PROXY_V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if data.len() >= PROXY_V1_MAX_LEN {
            return Err(HeaderError::Malformed("v1 header too long"));
        }
        return Ok(Decoded::Incomplete);
    };

    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| HeaderError::Malformed("v1 header is not ASCII"))?;
    let mut fields = line.split(' ').skip(1);
    let consumed = end + 2;

    let source = match fields.next() {
        Some("TCP4") | Some("TCP6") => {
            let src_ip: IpAddr = parse_field(fields.next())?;
            let _dst_ip: IpAddr = parse_field(fields.next())?;
            let src_port: u16 = parse_field(fields.next())?;
            let _dst_port: u16 = parse_field(fields.next())?;
            Some(SocketAddr::new(src_ip, src_port))
        }
        Some("UNKNOWN") => None,
        _ => return Err(HeaderError::Malformed("v1 unknown protocol family")),
    };

    Ok(Decoded::Header { source, consumed })
}

fn parse_field<T: std::str::FromStr>(field: Option<&str>) -> Result<T, HeaderError> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or(HeaderError::Malformed("v1 field missing or invalid"))
}

fn decode_v2(data: &[u8]) -> Result<Decoded, HeaderError> {
    if data.len() < V2_FIXED_LEN {
        return Ok(Decoded::Incomplete);
    }

    let version_command = data[12];
    let family_protocol = data[13];
    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    let consumed = V2_FIXED_LEN + addr_len;

    if data.len() < consumed {
        return Ok(Decoded::Incomplete);
    }

    match version_command {
        VERSION_COMMAND_LOCAL => return Ok(Decoded::Header { source: None, consumed }),
        VERSION_COMMAND_PROXY => {}
        _ => return Err(HeaderError::Malformed("v2 unknown version or command")),
    }

    let body = &data[V2_FIXED_LEN..consumed];
    let source = match family_protocol {
        x if x == (AF_INET | TRANSPORT_STREAM) => {
            if addr_len < IPV4_ADDR_LEN as usize {
                return Err(HeaderError::Malformed("v2 IPv4 block too short"));
            }
            let src_ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let src_port = u16::from_be_bytes([body[8], body[9]]);
            Some(SocketAddr::new(IpAddr::V4(src_ip), src_port))
        }
        x if x == (AF_INET6 | TRANSPORT_STREAM) => {
            if addr_len < IPV6_ADDR_LEN as usize {
                return Err(HeaderError::Malformed("v2 IPv6 block too short"));
            }
            let mut src_octets = [0u8; 16];
            src_octets.copy_from_slice(&body[..16]);
            let src_port = u16::from_be_bytes([body[32], body[33]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port))
        }
        // AF_UNSPEC, UDP and unix sockets carry nothing we can use.
        _ => None,
    };

    Ok(Decoded::Header { source, consumed })
}
