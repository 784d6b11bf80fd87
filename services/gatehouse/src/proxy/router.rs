//! Route table and routing decisions.
//!
//! This module holds the ordered route list and resolves the virtual host
//! a client announced into a concrete backend address.
//!
//! Matching rules:
//! - Client-side metadata after a `\0` in the hostname is discarded
//! - One trailing dot is stripped from both pattern and input
//! - Hostnames compare exactly; a pattern without a port matches any port
//! - Routes are scanned in configured order, first match wins
//! - Config updates are applied atomically (whole-table swap)

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::address::Address;
use super::proxy_protocol::ProxyProtocolVersion;
use super::srv::SrvResolver;

/// Port used when a target has no port and no service record.
pub const DEFAULT_GAME_PORT: u16 = 25565;

/// Kind of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// Route on the game handshake's virtual host.
    Handshake,
    /// A type this build does not understand; never matches.
    Unknown(String),
}

/// PROXY protocol configuration for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyProtocol {
    /// PROXY protocol disabled.
    #[default]
    Off,
    /// Send a header of the given version before any client bytes.
    On(ProxyProtocolVersion),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub kind: RouteKind,
    /// Virtual hosts this route accepts.
    pub matches: Vec<Address>,
    /// Backend to forward to. Without a port, the port comes from the
    /// target's service record or [`DEFAULT_GAME_PORT`].
    pub target: Address,
    pub proxy_protocol: ProxyProtocol,
}

impl Route {
    /// Normalize a hostname for matching by dropping one trailing dot.
    pub fn normalize_hostname(hostname: &str) -> &str {
        hostname.strip_suffix('.').unwrap_or(hostname)
    }

    /// Whether this route accepts a (cleaned) requested address.
    pub fn matches(&self, requested: &Address) -> bool {
        if self.kind != RouteKind::Handshake {
            return false;
        }

        let hostname = Self::normalize_hostname(requested.hostname());
        self.matches.iter().any(|pattern| {
            Self::normalize_hostname(pattern.hostname()) == hostname
                && pattern.port().map_or(true, |port| Some(port) == requested.port())
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RouteKind::Handshake => {
                let patterns: Vec<String> = self.matches.iter().map(ToString::to_string).collect();
                write!(f, "[{}] {} -> {}", self.id, patterns.join(", "), self.target)?;
            }
            RouteKind::Unknown(kind) => write!(f, "[{}] ({kind}) <unknown>", self.id)?,
        }
        match self.proxy_protocol {
            ProxyProtocol::Off => Ok(()),
            ProxyProtocol::On(ProxyProtocolVersion::V1) => f.write_str(" [proxy=v1]"),
            ProxyProtocol::On(ProxyProtocolVersion::V2) => f.write_str(" [proxy=v2]"),
        }
    }
}

/// Strip client metadata appended after a NUL (modded clients send
/// `host\0FML\0` and similar).
pub fn clean_hostname(hostname: &str) -> &str {
    match hostname.find('\0') {
        Some(idx) => &hostname[..idx],
        None => hostname,
    }
}

/// A matched route with its fully resolved backend address.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub route: Route,
    /// Target with a concrete port.
    pub address: Address,
}

/// Result of a routing decision.
#[derive(Debug, Clone)]
pub enum RoutingDecision {
    /// Route found, proceed with connection.
    Matched(RouteResult),
    /// No matching route found.
    NoMatch { reason: String },
}

/// Immutable snapshot of route data for lock-free reads.
#[derive(Debug)]
struct RouteSnapshot {
    /// When false every connection goes straight to pass-through.
    enabled: bool,
    routes: Vec<Route>,
}

impl Default for RouteSnapshot {
    fn default() -> Self {
        Self {
            enabled: true,
            routes: Vec::new(),
        }
    }
}

/// Route table managing all active routes.
///
/// Uses ArcSwap for lock-free atomic config updates.
/// Readers get consistent snapshots without blocking.
/// Writers atomically swap in new snapshots.
pub struct RouteTable {
    snapshot: ArcSwap<RouteSnapshot>,
}

impl RouteTable {
    /// Create a new empty route table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot::default()),
        }
    }

    /// Create a route table holding `routes`.
    pub fn with_routes(routes: Vec<Route>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouteSnapshot {
                enabled: true,
                routes,
            }),
        }
    }

    /// Replace the entire route table atomically in a single pointer swap.
    ///
    /// Lookups already in progress finish against the old snapshot.
    pub fn update(&self, routes: Vec<Route>) {
        self.replace(true, routes);
    }

    /// Replace routes and the enabled flag together.
    pub fn replace(&self, enabled: bool, routes: Vec<Route>) {
        let route_count = routes.len();
        self.snapshot.store(Arc::new(RouteSnapshot { enabled, routes }));
        info!(
            route_count = route_count,
            enabled = enabled,
            "Route table updated atomically"
        );
    }

    /// Whether connections should be sniffed at all.
    pub fn is_enabled(&self) -> bool {
        self.snapshot.load().enabled
    }

    /// First route (in configured order) accepting `requested`.
    pub fn find(&self, requested: &Address) -> Option<Route> {
        let snapshot = self.snapshot.load();
        snapshot.routes.iter().find(|r| r.matches(requested)).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;

/// Resolves requested virtual hosts into backend addresses.
pub struct Router {
    table: SharedRouteTable,
    srv: Arc<SrvResolver>,
    default_port: u16,
}

impl Router {
    pub fn new(table: SharedRouteTable, srv: Arc<SrvResolver>) -> Self {
        Self {
            table,
            srv,
            default_port: DEFAULT_GAME_PORT,
        }
    }

    pub fn table(&self) -> &SharedRouteTable {
        &self.table
    }

    /// Make a routing decision for the address a client asked for.
    pub async fn route(&self, requested: &Address) -> RoutingDecision {
        let cleaned = clean_hostname(requested.hostname());
        let Ok(requested) = requested.with_hostname(cleaned) else {
            return RoutingDecision::NoMatch {
                reason: "empty hostname after cleaning".to_string(),
            };
        };

        let Some(route) = self.table.find(&requested) else {
            return RoutingDecision::NoMatch {
                reason: format!("No route for '{requested}'"),
            };
        };

        let address = self.resolve_target(&route.target).await;
        debug!(
            route_id = %route.id,
            requested = %requested,
            target = %address,
            "Route matched"
        );

        RoutingDecision::Matched(RouteResult { route, address })
    }

    /// Fill in a missing target port from the service record or the default.
    async fn resolve_target(&self, target: &Address) -> Address {
        if target.port().is_some() {
            return target.clone();
        }

        if let Some(resolved) = self.srv.resolve(target.hostname()).await {
            return resolved;
        }

        Address::new(target.hostname(), Some(self.default_port))
            .unwrap_or_else(|_| target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::srv::testutil::StaticSrvLookup;
    use super::*;

    fn make_route(id: &str, patterns: &[&str], target: &str) -> Route {
        Route {
            id: id.to_string(),
            kind: RouteKind::Handshake,
            matches: patterns.iter().map(|p| Address::parse(p).unwrap()).collect(),
            target: Address::parse(target).unwrap(),
            proxy_protocol: ProxyProtocol::Off,
        }
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn router(routes: Vec<Route>, lookup: Arc<StaticSrvLookup>) -> Router {
        Router::new(
            Arc::new(RouteTable::with_routes(routes)),
            Arc::new(SrvResolver::new(lookup)),
        )
    }

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(Route::normalize_hostname("example.com."), "example.com");
        assert_eq!(Route::normalize_hostname("example.com"), "example.com");
        assert_eq!(Route::normalize_hostname("example.com.."), "example.com.");
    }

    #[test]
    fn test_clean_hostname() {
        assert_eq!(clean_hostname("a.example.com\0FML\0"), "a.example.com");
        assert_eq!(clean_hostname("a.example.com"), "a.example.com");
        assert_eq!(clean_hostname("\0FML2\0"), "");
    }

    #[test]
    fn test_match_trailing_dot_both_sides() {
        let route = make_route("r1", &["a.example.com."], "10.0.0.1:25565");
        assert!(route.matches(&addr("a.example.com:25565")));
        assert!(route.matches(&addr("a.example.com.:25565")));

        let route = make_route("r2", &["a.example.com"], "10.0.0.1:25565");
        assert!(route.matches(&addr("a.example.com.:1")));
    }

    #[test]
    fn test_match_is_exact() {
        let route = make_route("r1", &["a.example.com"], "10.0.0.1:25565");
        assert!(!route.matches(&addr("A.example.com:25565")));
        assert!(!route.matches(&addr("x.a.example.com:25565")));
        assert!(!route.matches(&addr("a.example.co:25565")));
    }

    #[test]
    fn test_match_port_constraint() {
        let route = make_route("r1", &["a.example.com:25565"], "10.0.0.1:25565");
        assert!(route.matches(&addr("a.example.com:25565")));
        assert!(!route.matches(&addr("a.example.com:25566")));

        let any_port = make_route("r2", &["a.example.com"], "10.0.0.1:25565");
        assert!(any_port.matches(&addr("a.example.com:1")));
        assert!(any_port.matches(&addr("a.example.com:65535")));
    }

    #[test]
    fn test_unknown_kind_never_matches() {
        let mut route = make_route("r1", &["a.example.com"], "10.0.0.1:25565");
        route.kind = RouteKind::Unknown("http".to_string());
        assert!(!route.matches(&addr("a.example.com:25565")));
    }

    #[test]
    fn test_first_match_wins() {
        let table = RouteTable::with_routes(vec![
            make_route("r1", &["a.example.com:25565"], "10.0.0.1:1"),
            make_route("r2", &["b.example.com", "a.example.com"], "10.0.0.2:2"),
            make_route("r3", &["a.example.com"], "10.0.0.3:3"),
        ]);

        assert_eq!(table.find(&addr("a.example.com:25565")).unwrap().id, "r1");
        assert_eq!(table.find(&addr("a.example.com:7")).unwrap().id, "r2");
        assert!(table.find(&addr("c.example.com:25565")).is_none());
    }

    #[test]
    fn test_update_swaps_whole_table() {
        let table = RouteTable::with_routes(vec![make_route("r1", &["a.example.com"], "x:1")]);
        assert_eq!(table.len(), 1);

        table.update(vec![
            make_route("r2", &["b.example.com"], "x:1"),
            make_route("r3", &["c.example.com"], "x:1"),
        ]);
        assert_eq!(table.len(), 2);
        assert!(table.find(&addr("a.example.com:1")).is_none());
        assert_eq!(table.find(&addr("c.example.com:1")).unwrap().id, "r3");

        table.update(Vec::new());
        assert!(table.is_empty());
        assert!(table.is_enabled());

        table.replace(false, vec![make_route("r4", &["d.example.com"], "x:1")]);
        assert!(!table.is_enabled());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_route_explicit_port_skips_srv() {
        let lookup = Arc::new(StaticSrvLookup::default());
        let router = router(
            vec![make_route("r1", &["b.example.com:25565"], "10.0.0.5:25566")],
            lookup.clone(),
        );

        match router.route(&addr("b.example.com:25565")).await {
            RoutingDecision::Matched(result) => {
                assert_eq!(result.route.id, "r1");
                assert_eq!(result.address, addr("10.0.0.5:25566"));
            }
            other => panic!("Expected Matched, got {:?}", other),
        }
        assert_eq!(lookup.query_count(), 0);
    }

    #[tokio::test]
    async fn test_route_uses_srv_record() {
        let lookup = Arc::new(StaticSrvLookup::with_record(
            "_minecraft._tcp.backend.internal",
            "node7.internal:30001",
        ));
        let router = router(
            vec![make_route("r1", &["a.example.com"], "backend.internal")],
            lookup,
        );

        match router.route(&addr("a.example.com:25565")).await {
            RoutingDecision::Matched(result) => {
                assert_eq!(result.address, addr("node7.internal:30001"));
            }
            other => panic!("Expected Matched, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_falls_back_to_default_port() {
        let lookup = Arc::new(StaticSrvLookup::default());
        let router = router(
            vec![make_route("r1", &["a.example.com"], "backend.internal")],
            lookup.clone(),
        );

        match router.route(&addr("a.example.com:25565")).await {
            RoutingDecision::Matched(result) => {
                assert_eq!(result.address, addr("backend.internal:25565"));
            }
            other => panic!("Expected Matched, got {:?}", other),
        }
        assert_eq!(lookup.query_count(), 1);
    }

    #[tokio::test]
    async fn test_route_strips_client_metadata() {
        let router = router(
            vec![make_route("r1", &["a.example.com"], "10.0.0.1:25565")],
            Arc::new(StaticSrvLookup::default()),
        );

        let requested = Address::new("a.example.com.\0FML\0", Some(25565)).unwrap();
        assert!(matches!(
            router.route(&requested).await,
            RoutingDecision::Matched(_)
        ));

        let metadata_only = Address::new("\0FML\0", Some(25565)).unwrap();
        assert!(matches!(
            router.route(&metadata_only).await,
            RoutingDecision::NoMatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_route_no_match() {
        let router = router(
            vec![make_route("r1", &["b.example.com"], "10.0.0.1:25565")],
            Arc::new(StaticSrvLookup::default()),
        );

        match router.route(&addr("a.example.com:25565")).await {
            RoutingDecision::NoMatch { reason } => assert!(reason.contains("a.example.com")),
            other => panic!("Expected NoMatch, got {:?}", other),
        }
    }
}
