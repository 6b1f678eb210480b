//! Configuration model, loading and discovery
//!
//! Discovery hierarchy:
//! 0. `JUMPHOST_CONFIG` environment variable (explicit file, no fallback)
//! 1. Current directory: ./jumphost.toml or ./.jumphost/config.toml
//! 2. User config: ~/.jumphost/config.toml
//! 3. System config: /etc/jumphost/config.toml
//! 4. Built-in defaults
//!
//! ```toml
//! runtime = "docker"
//! operation_timeout_secs = 60
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 200
//!
//! [[hosts]]
//! name = "build-01"
//! address = "10.0.0.7"
//! user = "deploy"
//! identity_file = "~/.ssh/build_ed25519"
//! ```

use crate::connection::ConnectionSettings;
use crate::env::{self, defaults};
use crate::host::{CredentialRef, Host, InvalidReference};
use crate::retry::RetryPolicy;
use crate::translator::RuntimeFlavor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Errors while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Host '{name}': {source}")]
    Host {
        name: String,
        #[source]
        source: InvalidReference,
    },

    #[error("Unknown host '{0}'")]
    UnknownHost(String),
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    /// Name used on the command line and as the host identity
    pub name: String,
    /// Host name or address, optionally `user@address:port`
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Private key; the SSH agent is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl HostEntry {
    pub fn to_host(&self) -> Result<Host, ConfigError> {
        let parsed = Host::parse(&self.address).map_err(|source| ConfigError::Host {
            name: self.name.clone(),
            source,
        })?;

        let mut host = parsed.with_id(self.name.clone());
        if self.port.is_some() {
            host = host.with_port(self.port);
        }
        if let Some(user) = &self.user {
            host = host.with_user(user.clone());
        }
        let credentials = match &self.identity_file {
            Some(path) => CredentialRef::IdentityFile {
                path: expand_home(path),
            },
            None => CredentialRef::Agent,
        };
        Ok(host.with_credentials(credentials))
    }
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Container runtime CLI on the hosts
    #[serde(default)]
    pub runtime: RuntimeFlavor,
    /// Per-attempt command timeout
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Transport handshake timeout
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Liveness probe timeout after an abandoned command
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

fn default_operation_timeout_secs() -> u64 {
    defaults::OPERATION_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    defaults::CONNECT_TIMEOUT_SECS
}

fn default_health_check_timeout_secs() -> u64 {
    defaults::HEALTH_CHECK_TIMEOUT_SECS
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeFlavor::default(),
            operation_timeout_secs: default_operation_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            retry: RetryPolicy::default(),
            hosts: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            retry: self.retry.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
        }
    }

    /// Check values a partial or hand-edited file may get wrong.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be within 0.0..=1.0".into()));
        }
        for (name, value) in [
            ("operation_timeout_secs", self.operation_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("health_check_timeout_secs", self.health_check_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.hosts {
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate host name '{}'",
                    entry.name
                )));
            }
            entry.to_host()?;
        }
        Ok(())
    }

    /// Resolve a host by configured name, falling back to parsing `spec`
    /// as an address.
    pub fn resolve_host(&self, spec: &str) -> Result<Host, ConfigError> {
        if let Some(entry) = self.hosts.iter().find(|h| h.name == spec) {
            return entry.to_host();
        }
        Host::parse(spec).map_err(|source| ConfigError::Host {
            name: spec.to_string(),
            source,
        })
    }

    /// Look up a configured host by name only.
    pub fn host(&self, name: &str) -> Result<Host, ConfigError> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| ConfigError::UnknownHost(name.to_string()))?
            .to_host()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = self.to_toml_string()?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn home_dir() -> Option<PathBuf> {
    std_env::var("HOME")
        .ok()
        .or_else(|| std_env::var("USERPROFILE").ok())
        .map(PathBuf::from)
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<ControllerConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return ControllerConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(ControllerConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        if let Ok(explicit) = std_env::var(env::vars::CONFIG) {
            debug!("Using {} = {}", env::vars::CONFIG, explicit);
            return Some(PathBuf::from(explicit));
        }

        for candidate in Self::config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    pub fn config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home) = home_dir() {
            candidates.push(env::user_config_file_path(&home));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_PATH));

        candidates
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        if let Ok(explicit) = std_env::var(env::vars::CONFIG) {
            println!("  {} = {:?}", env::vars::CONFIG, explicit);
        }

        for (i, candidate) in Self::config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "✓ EXISTS"
            } else if candidate.exists() {
                "✗ NOT A FILE"
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
