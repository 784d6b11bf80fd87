//! Hostname[:port] values.
//!
//! Addresses appear on both sides of routing: as the virtual host a client
//! announced in its handshake, and as the match patterns and targets of
//! configured routes. A missing port means "any port" on a pattern and
//! "resolve via service record" on a target.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing or validating an [`Address`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The hostname part is empty.
    #[error("address hostname cannot be empty")]
    EmptyHostname,

    /// The port part is not an integer.
    #[error("invalid port '{0}'")]
    InvalidPort(String),

    /// The port is an integer outside [0, 65535].
    #[error("port {0} out of range (must be between 0 and 65535)")]
    PortOutOfRange(i64),
}

/// An immutable `host[:port]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    hostname: String,
    port: Option<u16>,
}

impl Address {
    /// Create an address, rejecting an empty hostname.
    pub fn new(hostname: impl Into<String>, port: Option<u16>) -> Result<Self, AddressError> {
        let hostname = hostname.into();
        if hostname.is_empty() {
            return Err(AddressError::EmptyHostname);
        }
        Ok(Self { hostname, port })
    }

    /// Parse `"host"` or `"host:port"`, splitting at the first `:`.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        match s.split_once(':') {
            Some((hostname, port)) => Self::new(hostname, Some(parse_port(port)?)),
            None => Self::new(s, None),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Copy of this address with a different hostname.
    pub fn with_hostname(&self, hostname: impl Into<String>) -> Result<Self, AddressError> {
        Self::new(hostname, self.port)
    }

    /// Copy of this address with an explicit port.
    ///
    /// Takes a wide integer so callers holding values decoded from the wire
    /// (e.g. a signed 32-bit port) get a range error instead of truncation.
    pub fn with_port(&self, port: i64) -> Result<Self, AddressError> {
        let port = u16::try_from(port).map_err(|_| AddressError::PortOutOfRange(port))?;
        Ok(Self {
            hostname: self.hostname.clone(),
            port: Some(port),
        })
    }
}

fn parse_port(s: &str) -> Result<u16, AddressError> {
    let value: i64 = s
        .trim()
        .parse()
        .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
    u16::try_from(value).map_err(|_| AddressError::PortOutOfRange(value))
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.hostname, port),
            None => f.write_str(&self.hostname),
        }
    }
}
