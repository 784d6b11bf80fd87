pub mod config;
pub mod proxy;
pub mod reload;
pub mod routes_file;

pub use proxy::{
    Address, ConnectionHandler, Listener, ListenerConfig, ProxyProtocol, Route, RouteTable,
    Router, RoutingDecision, Session, SharedRouteTable, SniffResult, Verdict,
};
