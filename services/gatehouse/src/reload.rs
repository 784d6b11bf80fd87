//! Routes file reload loop.
//!
//! Polls the routes file's modification time and swaps a freshly validated
//! table into the shared [`RouteTable`](crate::proxy::RouteTable) when it
//! changes. An invalid file is reported and the running table is kept, so
//! the proxy continues operating on the last good configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::proxy::SharedRouteTable;
use crate::routes_file::{load_route_set, RoutesFileError};

/// Default poll period for the routes file.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(2);

/// Keeps a route table in sync with a routes file.
pub struct RouteReloader {
    path: PathBuf,
    table: SharedRouteTable,
    interval: Duration,
    /// Modification time of the last file we attempted to apply.
    last_seen: Option<SystemTime>,
}

impl RouteReloader {
    pub fn new(path: PathBuf, table: SharedRouteTable, interval: Duration) -> Self {
        Self {
            path,
            table,
            interval,
            last_seen: None,
        }
    }

    /// Load the file unconditionally and apply it.
    pub fn load_now(&mut self) -> Result<(), RoutesFileError> {
        self.last_seen = modified_time(&self.path);
        let set = load_route_set(&self.path)?;
        self.table.replace(set.enabled, set.routes);
        Ok(())
    }

    /// Apply the file if it changed since the last attempt.
    ///
    /// Returns `Ok(true)` when a new table was swapped in.
    pub fn reload_if_changed(&mut self) -> Result<bool, RoutesFileError> {
        let modified = modified_time(&self.path);
        if modified == self.last_seen {
            return Ok(false);
        }
        // Remember the attempt even if it fails, so a broken file is
        // reported once rather than on every poll.
        self.last_seen = modified;

        if modified.is_none() {
            warn!(path = %self.path.display(), "Routes file disappeared, keeping current routes");
            return Ok(false);
        }

        let set = load_route_set(&self.path)?;
        self.table.replace(set.enabled, set.routes);
        Ok(true)
    }

    /// Poll forever.
    pub async fn run(mut self) {
        info!(
            path = %self.path.display(),
            interval_ms = self.interval.as_millis() as u64,
            "Route reload loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the table was loaded at startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.reload_if_changed() {
                Ok(true) => info!(route_count = self.table.len(), "Routes reloaded"),
                Ok(false) => debug!("Routes file unchanged"),
                Err(e) => warn!(error = %e, "Invalid routes file, keeping current routes"),
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::proxy::{Address, RouteTable};

    const ONE_ROUTE: &str =
        r#"{ "routes": [ { "type": "minecraft", "match": "a.example.com", "target": "x:1" } ] }"#;
    const TWO_ROUTES: &str = r#"{ "enabled": false, "routes": [
        { "type": "minecraft", "match": "a.example.com", "target": "x:1" },
        { "type": "minecraft", "match": "b.example.com", "target": "x:2" } ] }"#;

    /// Rewrite `path` and push its mtime forward so coarse filesystem
    /// timestamps still register a change.
    fn rewrite(path: &Path, content: &str, bump: u64) {
        fs::write(path, content).unwrap();
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(bump)).unwrap();
    }

    #[test]
    fn test_reload_applies_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehouse.json");
        rewrite(&path, ONE_ROUTE, 0);

        let table: SharedRouteTable = Arc::new(RouteTable::new());
        let mut reloader = RouteReloader::new(path.clone(), table.clone(), DEFAULT_RELOAD_INTERVAL);

        reloader.load_now().unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.is_enabled());
        assert!(!reloader.reload_if_changed().unwrap());

        rewrite(&path, TWO_ROUTES, 10);
        assert!(reloader.reload_if_changed().unwrap());
        assert_eq!(table.len(), 2);
        assert!(!table.is_enabled());
        assert!(table
            .find(&Address::parse("b.example.com:25565").unwrap())
            .is_some());
    }

    #[test]
    fn test_invalid_file_keeps_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehouse.json");
        rewrite(&path, ONE_ROUTE, 0);

        let table: SharedRouteTable = Arc::new(RouteTable::new());
        let mut reloader = RouteReloader::new(path.clone(), table.clone(), DEFAULT_RELOAD_INTERVAL);
        reloader.load_now().unwrap();

        rewrite(
            &path,
            r#"{ "routes": [ { "type": "minecraft", "target": "x:1" } ] }"#,
            10,
        );
        assert!(reloader.reload_if_changed().is_err());
        assert_eq!(table.len(), 1);

        // Same broken file is not retried.
        assert!(!reloader.reload_if_changed().unwrap());

        fs::remove_file(&path).unwrap();
        assert!(!reloader.reload_if_changed().unwrap());
        assert_eq!(table.len(), 1);
    }
}
