//! Filesystem path constants.

/// Default config file path for the daemon.
pub const DEFAULT_CONFIG: &str = "/etc/memberd/config.yaml";

/// Default data directory for the state store.
pub const DEFAULT_DATA_DIR: &str = "/tmp/memberd-data";
