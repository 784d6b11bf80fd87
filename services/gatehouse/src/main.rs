//! Gatehouse
//!
//! Handshake-routing reverse proxy for game servers.
//!
//! This service:
//! - Accepts client connections on one port
//! - Reads the virtual host from the client's handshake
//! - Forwards to the matching backend, optionally with a PROXY header
//! - Passes unrouted connections to a fallback server (or closes them)
//! - Reloads routes when the routes file changes

use std::sync::Arc;

use anyhow::{Context, Result};
use gatehouse::config::Config;
use gatehouse::proxy::{
    BackendConnector, ClosePassthrough, ConnectionHandler, HickorySrvLookup, Listener,
    ListenerConfig, Passthrough, RouteTable, Router, SrvResolver, UpstreamPassthrough,
};
use gatehouse::reload::RouteReloader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to GATEHOUSE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gatehouse");
    info!(
        listen_addr = %config.listen_addr,
        routes_file = %config.routes_file.display(),
        fallback_addr = ?config.fallback_addr.as_ref().map(ToString::to_string),
        accept_proxy_protocol = config.accept_proxy_protocol,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    // Create shared state
    let route_table = Arc::new(RouteTable::new());
    let mut reloader = RouteReloader::new(
        config.routes_file.clone(),
        Arc::clone(&route_table),
        config.reload_interval,
    );
    reloader
        .load_now()
        .with_context(|| format!("Invalid routes file {}", config.routes_file.display()))?;

    let srv = Arc::new(SrvResolver::new(Arc::new(HickorySrvLookup::new())));
    let router = Arc::new(Router::new(Arc::clone(&route_table), srv));
    let connector = BackendConnector::new(config.connect_timeout);

    let passthrough: Arc<dyn Passthrough> = match &config.fallback_addr {
        Some(addr) => Arc::new(UpstreamPassthrough::new(addr.clone(), connector)),
        None => Arc::new(ClosePassthrough),
    };

    let handler = ConnectionHandler::new(router, Arc::new(connector), passthrough)
        .with_sniff_timeout(config.sniff_timeout)
        .with_inbound_proxy_protocol(config.accept_proxy_protocol);

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = Listener::bind(listener_config, Arc::new(handler))
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen_addr))?;

    // Start route reload loop
    tokio::spawn(reloader.run());

    // Run listener (blocks until error or shutdown)
    tokio::select! {
        result = Arc::new(listener).run() => {
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result.context("Listener failed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
