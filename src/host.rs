//! Host and container identity types.
//!
//! A [`Host`] is everything needed to reach a remote machine. It is immutable
//! once built; the connection manager keys its per-host state by [`HostId`].
//! A [`ContainerRef`] names a container on one host and is only a lookup key.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;
use url::Url;

/// Container names accepted by docker and podman, plus full or short hex IDs.
static CONTAINER_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,253}$").expect("container name pattern is valid")
});

/// Rejected host or container identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReference {
    #[error("Host specification is empty")]
    EmptyHost,

    #[error("Invalid host specification '{0}': {1}")]
    MalformedHost(String, String),

    #[error("Unsupported host scheme '{0}' (expected ssh)")]
    UnsupportedScheme(String),

    #[error("Invalid container name '{0}'")]
    InvalidContainerName(String),
}

/// Stable identity of a host, used as the key for connection state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reference to the credentials used to authenticate against a host.
///
/// Resolving the credential material is left to the transport (and, for SSH,
/// to the user's agent and `~/.ssh/config`); the controller only carries the
/// reference around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Private key file passed to the transport
    IdentityFile { path: PathBuf },
    /// Whatever the transport's agent offers
    Agent,
}

/// A remote machine reachable through a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    id: HostId,
    address: String,
    port: Option<u16>,
    user: Option<String>,
    credentials: Option<CredentialRef>,
}

impl Host {
    /// Create a host whose identity is its address.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            id: HostId::new(address.clone()),
            address,
            port: None,
            user: None,
            credentials: None,
        }
    }

    /// Parse `name`, `user@name`, `name:port` or `ssh://user@name:port`.
    ///
    /// The identity of the parsed host is the canonical `user@address:port`
    /// rendering of whatever parts were given.
    pub fn parse(spec: &str) -> Result<Self, InvalidReference> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(InvalidReference::EmptyHost);
        }

        let url = if spec.contains("://") {
            Url::parse(spec)
        } else {
            Url::parse(&format!("ssh://{spec}"))
        }
        .map_err(|e| InvalidReference::MalformedHost(spec.to_string(), e.to_string()))?;

        if url.scheme() != "ssh" {
            return Err(InvalidReference::UnsupportedScheme(url.scheme().to_string()));
        }
        if !matches!(url.path(), "" | "/") {
            return Err(InvalidReference::MalformedHost(
                spec.to_string(),
                "unexpected path component".to_string(),
            ));
        }

        let address = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(addr)) => addr.to_string(),
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(InvalidReference::MalformedHost(
                    spec.to_string(),
                    "missing host name".to_string(),
                ));
            }
        };
        if address.is_empty() {
            return Err(InvalidReference::MalformedHost(
                spec.to_string(),
                "missing host name".to_string(),
            ));
        }

        let user = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        let mut host = Self::new(address).with_port(url.port());
        if let Some(user) = user {
            host = host.with_user(user);
        }
        host.id = HostId::new(host.canonical_name());
        Ok(host)
    }

    /// Override the identity (e.g. with the name used in the config file).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = HostId::new(id);
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialRef) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn id(&self) -> &HostId {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn credentials(&self) -> Option<&CredentialRef> {
        self.credentials.as_ref()
    }

    /// `user@address` when a user is set, otherwise the bare address.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }

    fn canonical_name(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.destination(), port),
            None => self.destination(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Name or ID of a container on a specific host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerRef(String);

impl ContainerRef {
    /// Validate a container name or ID.
    ///
    /// Only names the runtime itself would accept are allowed, which also
    /// keeps them free of shell metacharacters.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidReference> {
        let name = name.into();
        if CONTAINER_NAME_RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(InvalidReference::InvalidContainerName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContainerRef {
    type Error = InvalidReference;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerRef> for String {
    fn from(value: ContainerRef) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_host() {
        let host = Host::parse("build-01.example.com").unwrap();
        assert_eq!(host.address(), "build-01.example.com");
        assert_eq!(host.user(), None);
        assert_eq!(host.port(), None);
        assert_eq!(host.id().as_str(), "build-01.example.com");
    }

    #[test]
    fn test_parse_user_and_port() {
        let host = Host::parse("deploy@10.0.0.7:2222").unwrap();
        assert_eq!(host.address(), "10.0.0.7");
        assert_eq!(host.user(), Some("deploy"));
        assert_eq!(host.port(), Some(2222));
        assert_eq!(host.destination(), "deploy@10.0.0.7");
        assert_eq!(host.id().as_str(), "deploy@10.0.0.7:2222");
    }

    #[test]
    fn test_parse_ssh_url() {
        let host = Host::parse("ssh://root@jump.internal").unwrap();
        assert_eq!(host.address(), "jump.internal");
        assert_eq!(host.user(), Some("root"));
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert_eq!(
            Host::parse("http://example.com"),
            Err(InvalidReference::UnsupportedScheme("http".to_string()))
        );
        assert_eq!(Host::parse("  "), Err(InvalidReference::EmptyHost));
        assert!(Host::parse("ssh://host/some/path").is_err());
    }

    #[test]
    fn test_with_id_overrides_identity() {
        let host = Host::parse("ops@10.1.1.1").unwrap().with_id("h1");
        assert_eq!(host.id(), &HostId::from("h1"));
        assert_eq!(host.to_string(), "h1");
    }

    #[test]
    fn test_container_ref_validation() {
        assert!(ContainerRef::new("web").is_ok());
        assert!(ContainerRef::new("mycsar-0a1b2c3d.test_1").is_ok());
        assert!(ContainerRef::new("").is_err());
        assert!(ContainerRef::new("-leading-dash").is_err());
        assert!(ContainerRef::new("web; rm -rf /").is_err());
        assert!(ContainerRef::new("$(whoami)").is_err());
    }

    #[test]
    fn test_container_ref_deserialize_validates() {
        let ok: Result<ContainerRef, _> = serde_json::from_str("\"web\"");
        assert!(ok.is_ok());
        let bad: Result<ContainerRef, _> = serde_json::from_str("\"a b\"");
        assert!(bad.is_err());
    }
}
