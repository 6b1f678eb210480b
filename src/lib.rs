//! # Jumphost
//!
//! Controls containers on remote hosts over SSH. A caller describes an
//! operation (start, run, stop, inspect, logs, remove, exec, put) against a
//! container on a host; the controller turns it into a runtime command, runs
//! it over a pooled connection with per-host serialization and bounded retry,
//! and reports a typed outcome.
//!
//! ## Architecture Overview
//!
//! - **[`controller`]**: `apply`, `apply_all` and `stream_logs`; owns the state cache
//! - **[`translator`]**: operation → command line, raw output → typed result
//! - **[`connection`]**: one lazily opened connection per host, FIFO access, health tracking
//! - **[`executor`]**: runs one command on an acquired connection under a timeout
//! - **[`retry`]**: exponential backoff with jitter, transient vs permanent failures
//! - **[`transport`]**: the "run a command on a host" boundary (OpenSSH, local shell, scripted)
//! - **[`state`]**: last observed state per container
//! - **[`config`]**: TOML configuration and discovery
//!
//! ## Features
//!
//! ### 🔌 Connections
//! - **Lazy & Reused**: a host's connection is opened on first use and kept
//! - **Serialized**: at most one command in flight per host, waiters served in order
//! - **Self-Healing**: broken connections are rebuilt on the next use
//!
//! ### 🔁 Failure Handling
//! - **Classified**: transport and runtime errors are transient or permanent
//! - **Bounded Retry**: transient failures are retried with backoff
//! - **Typed Outcomes**: every failure maps to a stable [`FailureKind`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jumphost::{ContainerController, ControllerConfig, ContainerRef, Host, OperationKind,
//!     OperationRequest, SshOptions, SshTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ControllerConfig::default();
//!     let transport = SshTransport::new(SshOptions::default())?;
//!     let controller = ContainerController::with_transport(transport, &config);
//!
//!     let request = OperationRequest::new(
//!         Host::parse("deploy@build-01")?,
//!         ContainerRef::new("web")?,
//!         OperationKind::Inspect,
//!     );
//!     let result = controller.apply(request).await;
//!     println!("{:?}", result.outcome);
//!
//!     controller.disconnect_all().await;
//!     Ok(())
//! }
//! ```

/// Host and container identity types.
pub mod host;

/// Transport boundary and its implementations.
pub mod transport;

/// Retry/backoff policy shared by connection setup and dispatch.
pub mod retry;

/// Per-host connection lifecycle and serialization.
pub mod connection;

/// Command execution on an acquired connection.
pub mod executor;

/// Operation → command translation and output parsing.
pub mod translator;

/// Cached container states.
pub mod state;

/// The container controller.
pub mod controller;

/// Controller configuration and discovery.
pub mod config;

/// Environment constants and path utilities.
///
/// Centralizes file names, environment variable names and default values.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use config::{ConfigDiscovery, ConfigError, ControllerConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use controller::{
    ContainerController, Failure, FailureKind, LogStream, OperationRequest, OperationResult,
};
pub use host::{ContainerRef, Host, HostId};
pub use retry::RetryPolicy;
pub use state::ContainerState;
pub use translator::{OperationKind, OperationOutput, RuntimeFlavor};
pub use transport::{LocalTransport, Transport, TransportError};

#[cfg(feature = "ssh")]
pub use transport::{SshOptions, SshTransport};
