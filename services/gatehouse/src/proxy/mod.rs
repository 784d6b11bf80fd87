//! Handshake-routing TCP proxy.
//!
//! This module provides:
//! - Handshake sniffers for the modern and legacy client protocols
//! - The per-connection session that holds pre-route bytes
//! - Route matching with service-record resolution
//! - PROXY protocol v1/v2 encoding (outbound) and decoding (inbound)
//! - Bidirectional relaying and pass-through of unrouted connections
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> Sniffers -> Router -> Backend
//!                          |                     |
//!                          |            PROXY header (if enabled)
//!                          v
//!                     Passthrough (no route / unknown protocol)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{ClosePassthrough, ConnectionHandler, Listener, ListenerConfig, Router};
//!
//! let table = Arc::new(RouteTable::new());
//! let srv = Arc::new(SrvResolver::new(Arc::new(HickorySrvLookup::new())));
//! let router = Arc::new(Router::new(table, srv));
//! let handler = ConnectionHandler::new(router, Arc::new(BackendConnector::default()), Arc::new(ClosePassthrough));
//!
//! let config = ListenerConfig::new("0.0.0.0:25565".parse()?);
//! let listener = Listener::bind(config, Arc::new(handler)).await?;
//! Arc::new(listener).run().await?;
//! ```

mod address;
mod backend;
mod connection;
mod listener;
mod passthrough;
mod proxy_protocol;
mod relay;
mod router;
mod session;
mod sniff;
mod srv;

pub use address::{Address, AddressError};
pub use backend::{BackendConnector, Dialer};
pub use connection::{ConnectionError, ConnectionHandler, Outcome, DEFAULT_SNIFF_TIMEOUT};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use passthrough::{ClosePassthrough, Passthrough, UpstreamPassthrough};
pub use proxy_protocol::{
    decode as decode_proxy_header, Decoded, HeaderError, ProxyHeader, ProxyProtocolVersion,
    PROXY_V2_SIGNATURE,
};
pub use relay::{relay, RelayStats};
pub use router::{
    clean_hostname, ProxyProtocol, Route, RouteKind, RouteResult, RouteTable, Router,
    RoutingDecision, SharedRouteTable, DEFAULT_GAME_PORT,
};
pub use session::{Session, SessionError, SessionState, Verdict, HOLD_BUFFER_CAP};
pub use sniff::{
    default_chain, ByteCursor, LegacySniffer, ModernSniffer, SniffResult, Sniffer, SnifferChain,
};
pub use srv::{
    HickorySrvLookup, SrvLookup, SrvResolver, DEFAULT_SRV_MAX_ENTRIES, DEFAULT_SRV_SERVICE,
    DEFAULT_SRV_TTL,
};
