//! Gatehouse configuration.
//!
//! Process settings come from the environment; routes live in a separate
//! JSON file (see [`crate::routes_file`]) so they can be reloaded.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{Address, DEFAULT_MAX_CONNECTIONS, DEFAULT_SNIFF_TIMEOUT};
use crate::reload::DEFAULT_RELOAD_INTERVAL;

/// Gatehouse configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the proxy listens on.
    pub listen_addr: SocketAddr,

    /// Path of the JSON routes file.
    pub routes_file: PathBuf,

    /// Server that receives unrouted connections. Without one they are closed.
    pub fallback_addr: Option<Address>,

    /// Expect a PROXY v1/v2 header from an upstream balancer on every connection.
    pub accept_proxy_protocol: bool,

    /// Max concurrent client connections.
    pub max_connections: usize,

    /// Time a client has to complete its handshake.
    pub sniff_timeout: Duration,

    /// Backend connect timeout; `None` uses the OS default.
    pub connect_timeout: Option<Duration>,

    /// Poll interval for routes file changes.
    pub reload_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("GATEHOUSE_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:25565".to_string())
            .parse()
            .context("GATEHOUSE_LISTEN_ADDR must be a socket address (ip:port).")?;

        let routes_file = var("GATEHOUSE_ROUTES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("gatehouse.json"));

        let fallback_addr = var("GATEHOUSE_FALLBACK_ADDR")
            .filter(|v| !v.trim().is_empty())
            .map(|v| Address::parse(v.trim()))
            .transpose()
            .context("GATEHOUSE_FALLBACK_ADDR must be host:port.")?;

        let accept_proxy_protocol = var("GATEHOUSE_ACCEPT_PROXY_PROTOCOL")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let max_connections: usize = var("GATEHOUSE_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("GATEHOUSE_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let sniff_timeout = var("GATEHOUSE_SNIFF_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("GATEHOUSE_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SNIFF_TIMEOUT);

        let connect_timeout = var("GATEHOUSE_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("GATEHOUSE_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis);

        let reload_interval = var("GATEHOUSE_RELOAD_INTERVAL_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("GATEHOUSE_RELOAD_INTERVAL_MS must be an integer (milliseconds).")?
            .map(|ms| Duration::from_millis(ms.max(50)))
            .unwrap_or(DEFAULT_RELOAD_INTERVAL);

        let log_level = var("GATEHOUSE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routes_file,
            fallback_addr,
            accept_proxy_protocol,
            max_connections,
            sniff_timeout,
            connect_timeout,
            reload_interval,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:25565".parse().unwrap());
        assert_eq!(config.routes_file, PathBuf::from("gatehouse.json"));
        assert!(config.fallback_addr.is_none());
        assert!(!config.accept_proxy_protocol);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.sniff_timeout, Duration::from_secs(30));
        assert!(config.connect_timeout.is_none());
        assert_eq!(config.reload_interval, Duration::from_secs(2));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("GATEHOUSE_LISTEN_ADDR", "127.0.0.1:25577"),
            ("GATEHOUSE_ROUTES_FILE", "/etc/gatehouse/routes.json"),
            ("GATEHOUSE_FALLBACK_ADDR", "127.0.0.1:25566"),
            ("GATEHOUSE_ACCEPT_PROXY_PROTOCOL", "true"),
            ("GATEHOUSE_MAX_CONNECTIONS", "64"),
            ("GATEHOUSE_SNIFF_TIMEOUT_MS", "500"),
            ("GATEHOUSE_CONNECT_TIMEOUT_MS", "2000"),
            ("GATEHOUSE_RELOAD_INTERVAL_MS", "10"),
            ("GATEHOUSE_LOG_LEVEL", "debug"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 25577);
        assert_eq!(
            config.fallback_addr,
            Some(Address::parse("127.0.0.1:25566").unwrap())
        );
        assert!(config.accept_proxy_protocol);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.sniff_timeout, Duration::from_millis(500));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(2)));
        // Clamped to the minimum poll period.
        assert_eq!(config.reload_interval, Duration::from_millis(50));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("GATEHOUSE_LISTEN_ADDR", "nope")]).is_err());
        assert!(load(&[("GATEHOUSE_MAX_CONNECTIONS", "many")]).is_err());
        assert!(load(&[("GATEHOUSE_FALLBACK_ADDR", "host:99999")]).is_err());
        assert!(load(&[("GATEHOUSE_SNIFF_TIMEOUT_MS", "-1")]).is_err());
    }
}
