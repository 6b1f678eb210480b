//! Environment constants and path utilities for jumphost.
//!
//! This module centralizes the file names, environment variables and default
//! values used throughout the controller so they stay consistent between the
//! library, the binary and the tests.

use std::path::{Path, PathBuf};

/// Hidden per-project directory name
pub const JUMPHOST_DIR_NAME: &str = ".jumphost";

/// Configuration file name inside [`JUMPHOST_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "jumphost.toml";

/// System-wide configuration path (Unix-like systems)
pub const SYSTEM_CONFIG_PATH: &str = "/etc/jumphost/config.toml";

/// Environment variable names
pub mod vars {
    /// Explicit configuration file, bypasses discovery
    pub const CONFIG: &str = "JUMPHOST_CONFIG";

    /// Host used by the tagged SSH integration tests
    pub const TEST_SSH_HOST: &str = "JUMPHOST_TEST_SSH_HOST";
}

/// Default values for configuration fields
pub mod defaults {
    /// Per-attempt command timeout in seconds
    pub const OPERATION_TIMEOUT_SECS: u64 = 60;

    /// SSH handshake timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Timeout for the post-timeout connection health check
    pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

    /// Dispatch attempts before a transient failure is surfaced
    pub const MAX_ATTEMPTS: u32 = 3;

    /// First backoff delay in milliseconds
    pub const BASE_DELAY_MS: u64 = 200;

    /// Upper bound of a single backoff delay in milliseconds
    pub const MAX_DELAY_MS: u64 = 10_000;

    /// Exponential growth factor between attempts
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Relative jitter applied to each delay (0.1 = ±10%)
    pub const JITTER: f64 = 0.1;

    /// Lines fetched by a non-following log snapshot
    pub const LOG_TAIL_LINES: usize = 200;

    /// Bytes of stdout/stderr kept in an operation result for diagnostics
    pub const DIAGNOSTIC_TAIL_BYTES: usize = 4096;

    /// Image used when a start request carries no explicit image
    pub const CONTAINER_IMAGE: &str = "alpine:latest";
}

/// Build the `.jumphost` directory path from a project root
pub fn jumphost_dir_path(root: &Path) -> PathBuf {
    root.join(JUMPHOST_DIR_NAME)
}

/// Build the project-local config file path (`<root>/.jumphost/config.toml`)
pub fn local_config_file_path(root: &Path) -> PathBuf {
    jumphost_dir_path(root).join(CONFIG_FILE_NAME)
}

/// Build the user config file path (`~/.jumphost/config.toml`)
pub fn user_config_file_path(home: &Path) -> PathBuf {
    jumphost_dir_path(home).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let root = Path::new("/srv/project");
        assert_eq!(
            local_config_file_path(root),
            PathBuf::from("/srv/project/.jumphost/config.toml")
        );
        assert_eq!(
            user_config_file_path(Path::new("/home/ops")),
            PathBuf::from("/home/ops/.jumphost/config.toml")
        );
    }
}
