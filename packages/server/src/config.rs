//! Service configuration.
//!
//! All fields have working defaults so a bare `[service]`-less TOML file
//! (or none at all) yields a runnable service. Durations are expressed in
//! whole seconds in the file and exposed as [`std::time::Duration`]
//! through accessors.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration consumed by the engine and the `peerstored`
/// binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Path of the UNIX socket the service listens on.
    pub socket: PathBuf,
    /// Name of the storage backend to open (`"sqlite"` or `"memory"`).
    pub database: String,
    /// Seconds between expiry-sweeper firings.
    pub sweep_interval_secs: u64,
    /// Seconds to wait for connected clients to finish during shutdown.
    pub drain_timeout_secs: u64,
    /// Bounded per-connection outbound queue capacity.
    pub outbound_channel_capacity: usize,
    /// SQLite backend settings.
    pub sqlite: SqliteConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/peerstore/peerstore.sock"),
            database: "sqlite".to_string(),
            sweep_interval_secs: 300,
            drain_timeout_secs: 10,
            outbound_channel_capacity: 256,
            sqlite: SqliteConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Interval between expiry-sweeper firings.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Time allowed for connected clients to wind down at shutdown.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Settings for the SQLite backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqliteConfig {
    /// Path of the database file. Missing parent directories are created
    /// at open.
    pub filename: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::from("/var/lib/peerstore/peerstore.sqlite"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_runnable() {
        let config = ServiceConfig::default();
        assert_eq!(config.database, "sqlite");
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.outbound_channel_capacity, 256);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: ServiceConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(config.database, ServiceConfig::default().database);
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config: ServiceConfig = toml::from_str(
            r#"
            socket = "/tmp/ps.sock"
            database = "memory"
            sweep_interval_secs = 5

            [sqlite]
            filename = "/tmp/ps.sqlite"
            "#,
        )
        .expect("parse config");
        assert_eq!(config.socket, PathBuf::from("/tmp/ps.sock"));
        assert_eq!(config.database, "memory");
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.sqlite.filename, PathBuf::from("/tmp/ps.sqlite"));
        // Untouched fields keep their defaults.
        assert_eq!(config.drain_timeout_secs, 10);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<ServiceConfig>("databse = \"sqlite\"").is_err());
    }
}
