//! Routes file loading and validation.
//!
//! The routes file is JSON:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "routes": [
//!     { "type": "minecraft", "match": "a.example.com", "target": "10.0.0.5:25566",
//!       "haproxy_protocol": true, "haproxy_protocol_version": 2 }
//!   ]
//! }
//! ```
//!
//! A file is validated as a whole; one bad route rejects the file so a
//! reload never applies half a configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::proxy::{Address, ProxyProtocol, ProxyProtocolVersion, Route, RouteKind};

/// Route type matched against the game handshake.
pub const HANDSHAKE_ROUTE_TYPE: &str = "minecraft";

#[derive(Debug, Error)]
pub enum RoutesFileError {
    #[error("failed to read routes file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse routes file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("route #{index}: {reason}")]
    InvalidRoute { index: usize, reason: String },
}

/// On-disk routes file.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutesFile {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

impl Default for RoutesFile {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    /// Identifier used in logs; defaults to `route-<index>`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    /// Single match pattern, shorthand for a one-element `matches`.
    #[serde(rename = "match", default)]
    pub single_match: Option<String>,
    #[serde(default)]
    pub matches: Vec<String>,
    pub target: String,
    #[serde(default)]
    pub haproxy_protocol: bool,
    #[serde(default = "default_proxy_protocol_version")]
    pub haproxy_protocol_version: u8,
}

fn default_enabled() -> bool {
    true
}

fn default_proxy_protocol_version() -> u8 {
    2
}

/// Validated contents of a routes file.
#[derive(Debug, Clone)]
pub struct RouteSet {
    pub enabled: bool,
    pub routes: Vec<Route>,
}

impl RoutesFile {
    /// Read and parse `path`.
    ///
    /// A missing file yields an enabled, empty configuration.
    pub fn load(path: &Path) -> Result<Self, RoutesFileError> {
        if !path.exists() {
            debug!(path = %path.display(), "No routes file, starting with no routes");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| RoutesFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| RoutesFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate every entry and build the route list in file order.
    pub fn into_route_set(self) -> Result<RouteSet, RoutesFileError> {
        let routes = self
            .routes
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.into_route(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RouteSet {
            enabled: self.enabled,
            routes,
        })
    }
}

impl RouteEntry {
    fn into_route(self, index: usize) -> Result<Route, RoutesFileError> {
        let invalid = |reason: String| RoutesFileError::InvalidRoute { index, reason };

        let patterns: Vec<String> = self.single_match.into_iter().chain(self.matches).collect();
        if patterns.is_empty() {
            return Err(invalid("no match pattern".to_string()));
        }

        let matches = patterns
            .iter()
            .map(|p| Address::parse(p).map_err(|e| invalid(format!("match '{p}': {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        let target = Address::parse(&self.target)
            .map_err(|e| invalid(format!("target '{}': {e}", self.target)))?;

        let proxy_protocol = if self.haproxy_protocol {
            let version = ProxyProtocolVersion::try_from(self.haproxy_protocol_version)
                .map_err(|e| invalid(e.to_string()))?;
            ProxyProtocol::On(version)
        } else {
            ProxyProtocol::Off
        };

        let kind = if self.kind == HANDSHAKE_ROUTE_TYPE {
            RouteKind::Handshake
        } else {
            warn!(index, route_type = %self.kind, "Unknown route type, route will never match");
            RouteKind::Unknown(self.kind)
        };

        Ok(Route {
            id: self.id.unwrap_or_else(|| format!("route-{index}")),
            kind,
            matches,
            target,
            proxy_protocol,
        })
    }
}

/// Load, validate and log the routes in `path`.
pub fn load_route_set(path: &Path) -> Result<RouteSet, RoutesFileError> {
    let set = RoutesFile::load(path)?.into_route_set()?;

    info!(
        path = %path.display(),
        enabled = set.enabled,
        route_count = set.routes.len(),
        "Loaded routes"
    );
    for route in &set.routes {
        debug!(route = %route, "Route");
    }

    Ok(set)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(json: &str) -> Result<RouteSet, RoutesFileError> {
        serde_json::from_str::<RoutesFile>(json)
            .unwrap()
            .into_route_set()
    }

    #[test]
    fn test_parse_full_file() {
        let set = parse(
            r#"{
                "enabled": true,
                "routes": [
                    { "type": "minecraft", "match": "a.example.com", "target": "backend.internal" },
                    { "id": "survival", "type": "minecraft",
                      "matches": ["b.example.com:25565", "c.example.com"],
                      "target": "10.0.0.5:25566",
                      "haproxy_protocol": true, "haproxy_protocol_version": 1 }
                ]
            }"#,
        )
        .unwrap();

        assert!(set.enabled);
        assert_eq!(set.routes.len(), 2);

        let first = &set.routes[0];
        assert_eq!(first.id, "route-0");
        assert_eq!(first.kind, RouteKind::Handshake);
        assert_eq!(first.target.port(), None);
        assert_eq!(first.proxy_protocol, ProxyProtocol::Off);

        let second = &set.routes[1];
        assert_eq!(second.id, "survival");
        assert_eq!(second.matches.len(), 2);
        assert_eq!(second.matches[0].port(), Some(25565));
        assert_eq!(
            second.proxy_protocol,
            ProxyProtocol::On(ProxyProtocolVersion::V1)
        );
    }

    #[test]
    fn test_defaults() {
        let set = parse(
            r#"{ "routes": [ { "type": "minecraft", "match": "a.example.com",
                               "target": "x:1", "haproxy_protocol": true } ] }"#,
        )
        .unwrap();
        assert!(set.enabled);
        assert_eq!(
            set.routes[0].proxy_protocol,
            ProxyProtocol::On(ProxyProtocolVersion::V2)
        );

        let empty = parse("{}").unwrap();
        assert!(empty.enabled);
        assert!(empty.routes.is_empty());
    }

    #[test]
    fn test_disabled_file() {
        let set = parse(r#"{ "enabled": false, "routes": [] }"#).unwrap();
        assert!(!set.enabled);
    }

    #[test]
    fn test_unknown_type_kept() {
        let set = parse(
            r#"{ "routes": [ { "type": "http", "match": "a.example.com", "target": "x:1" } ] }"#,
        )
        .unwrap();
        assert_eq!(set.routes[0].kind, RouteKind::Unknown("http".to_string()));
    }

    #[test]
    fn test_invalid_routes_rejected() {
        let cases = [
            r#"{ "routes": [ { "type": "minecraft", "target": "x:1" } ] }"#,
            r#"{ "routes": [ { "type": "minecraft", "match": "a:99999", "target": "x:1" } ] }"#,
            r#"{ "routes": [ { "type": "minecraft", "match": "a", "target": ":1" } ] }"#,
            r#"{ "routes": [ { "type": "minecraft", "match": "a", "target": "x:1",
                               "haproxy_protocol": true, "haproxy_protocol_version": 3 } ] }"#,
        ];
        for json in cases {
            assert!(
                matches!(parse(json), Err(RoutesFileError::InvalidRoute { index: 0, .. })),
                "{json}"
            );
        }
    }

    #[test]
    fn test_version_ignored_when_proxy_protocol_off() {
        let set = parse(
            r#"{ "routes": [ { "type": "minecraft", "match": "a", "target": "x:1",
                               "haproxy_protocol_version": 7 } ] }"#,
        )
        .unwrap();
        assert_eq!(set.routes[0].proxy_protocol, ProxyProtocol::Off);
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehouse.json");

        // Missing file is an empty, enabled configuration.
        let set = load_route_set(&path).unwrap();
        assert!(set.enabled);
        assert!(set.routes.is_empty());

        let mut file = fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{ "routes": [ {{ "type": "minecraft", "match": "a.example.com", "target": "x:1" }} ] }}"#
        )
        .unwrap();
        drop(file);
        assert_eq!(load_route_set(&path).unwrap().routes.len(), 1);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_route_set(&path),
            Err(RoutesFileError::Parse { .. })
        ));
    }
}
