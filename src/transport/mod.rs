//! # Transport Boundary
//!
//! The controller never speaks SSH (or any other wire protocol) itself. It
//! talks to a [`Transport`], which offers exactly three capabilities:
//!
//! - **connect** a [`Host`] and hand back an opaque session,
//! - **run** one fully formed command line on that session and report its
//!   exit code, stdout and stderr,
//! - **open a stream** of output lines for long-running commands such as
//!   `logs --follow`.
//!
//! Everything above this layer (serialization, retry, parsing) is transport
//! independent, so the same controller drives an OpenSSH ControlMaster
//! ([`ssh::SshTransport`]), a local shell ([`local::LocalTransport`]) or the
//! deterministic [`scripted::ScriptedTransport`] used by the test-suite.
//!
//! ## Failure Model
//!
//! A transport call either completes (any exit code, including non-zero) or
//! fails with a [`TransportError`]. A non-zero exit is a *successful
//! execution of a failing command* and is never reported as a transport
//! error. Every [`TransportError`] knows whether it is worth retrying via
//! [`TransportError::class`].

use crate::host::{Host, HostId};
use crate::retry::FailureClass;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Local shell execution (`sh -c`).
pub mod local;

/// Child-process helpers shared by the process based transports.
pub(crate) mod process;

/// Scripted transport for tests and dry runs.
pub mod scripted;

/// OpenSSH transport with a persistent master connection per host.
#[cfg(feature = "ssh")]
pub mod ssh;

pub use local::LocalTransport;
pub use scripted::{RecordedCall, ScriptedReply, ScriptedSession, ScriptedTransport};

#[cfg(feature = "ssh")]
pub use ssh::{SshOptions, SshTransport};

/// A fully formed command line plus optional bytes for its stdin.
///
/// Escaping has already happened by the time a command reaches a transport;
/// the line is handed to the remote shell verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub line: String,
    pub stdin: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// Raw outcome of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutput {
    /// Exit code (0 = success, non-zero = failure, -1 = killed by signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Connection-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Host name could not be resolved
    #[error("DNS lookup failed for {host}: {detail}")]
    DnsLookup { host: String, detail: String },

    /// Remote end refused the connection
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    /// Established channel dropped mid-command
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// No response within the allotted time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials rejected or expired
    #[error("Authentication failed for {host}: {detail}")]
    AuthenticationFailed { host: String, detail: String },

    /// Session used after it was torn down
    #[error("Not connected to {0}")]
    NotConnected(HostId),

    /// The local transport client could not be launched
    #[error("Failed to launch transport client: {0}")]
    Spawn(String),

    /// Broken pipe or similar I/O failure while talking to the client
    #[error("Transport I/O error: {0}")]
    Io(String),

    /// Anything the transport does not understand
    #[error("Transport protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether retrying the same dispatch can succeed.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::DnsLookup { .. }
            | Self::ConnectionRefused(_)
            | Self::ConnectionReset(_)
            | Self::Timeout(_)
            | Self::NotConnected(_)
            | Self::Io(_) => FailureClass::Transient,
            Self::AuthenticationFailed { .. } | Self::Spawn(_) | Self::Protocol(_) => {
                FailureClass::Permanent
            }
        }
    }

    /// Whether the command may already have reached the host when this
    /// error ended the call (its answer was lost, not its request).
    pub fn after_dispatch(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset(_) | Self::Timeout(_) | Self::Io(_)
        )
    }

    /// Short stable name used in logs and statistics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::DnsLookup { .. } => "DnsLookup",
            Self::ConnectionRefused(_) => "ConnectionRefused",
            Self::ConnectionReset(_) => "ConnectionReset",
            Self::Timeout(_) => "Timeout",
            Self::AuthenticationFailed { .. } => "AuthenticationFailed",
            Self::NotConnected(_) => "NotConnected",
            Self::Spawn(_) => "Spawn",
            Self::Io(_) => "Io",
            Self::Protocol(_) => "Protocol",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Self::Spawn(err.to_string())
            }
            std::io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                Self::ConnectionReset(err.to_string())
            }
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Abstract "execute command on host" capability.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Live channel to one host; owned by the connection manager.
    type Session: Send + Sync + 'static;

    /// Establish a session (handshake, authentication).
    async fn connect(&self, host: &Host) -> Result<Self::Session, TransportError>;

    /// Run one command to completion. Timeouts are applied by the caller.
    async fn run(
        &self,
        session: &Self::Session,
        command: &RemoteCommand,
    ) -> Result<RawOutput, TransportError>;

    /// Start a command whose stdout is consumed line by line.
    ///
    /// The returned stream owns its own channel and outlives the call.
    async fn open_stream(
        &self,
        session: &Self::Session,
        command_line: &str,
    ) -> Result<LineStream, TransportError>;

    /// Cheap liveness probe for a session that may have gone stale.
    async fn health_check(&self, session: &Self::Session) -> Result<(), TransportError>;

    /// Tear a session down. Errors are logged, not returned.
    async fn disconnect(&self, session: Self::Session);

    /// Transport name for logging
    fn transport_type(&self) -> &'static str;
}

/// Lazy, non-restartable sequence of output lines from a streaming command.
///
/// Lines are produced by a background task; dropping the stream aborts that
/// task (and with it the underlying child process or channel). Once the
/// stream yields `None` it is exhausted for good; a new stream has to be
/// requested.
pub struct LineStream {
    rx: mpsc::Receiver<Result<String, TransportError>>,
    producer: Option<JoinHandle<()>>,
}

impl LineStream {
    /// Channel capacity between the producer task and the consumer.
    pub const BUFFER: usize = 256;

    pub fn new(
        rx: mpsc::Receiver<Result<String, TransportError>>,
        producer: Option<JoinHandle<()>>,
    ) -> Self {
        Self { rx, producer }
    }

    /// A finite stream over already known lines.
    pub fn from_lines<I>(lines: I) -> Self
    where
        I: IntoIterator<Item = Result<String, TransportError>>,
    {
        let items: Vec<_> = lines.into_iter().collect();
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            // Capacity covers every item, so this never fails.
            let _ = tx.try_send(item);
        }
        Self::new(rx, None)
    }

    /// Wait for the next line; `None` once the producer is done.
    pub async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }
}

impl Stream for LineStream {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl std::fmt::Debug for LineStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineStream")
            .field("producer_running", &self.producer.as_ref().map(|p| !p.is_finished()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_transport_error_classification() {
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).class(),
            FailureClass::Transient
        );
        assert_eq!(
            TransportError::ConnectionRefused("h1".into()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            TransportError::AuthenticationFailed {
                host: "h1".into(),
                detail: "Permission denied (publickey)".into()
            }
            .class(),
            FailureClass::Permanent
        );
        assert_eq!(
            TransportError::Spawn("ssh: not found".into()).class(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_lost_answers_are_after_dispatch() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).after_dispatch());
        assert!(TransportError::ConnectionReset("eof".into()).after_dispatch());
        assert!(!TransportError::NotConnected("h1".into()).after_dispatch());
        assert!(!TransportError::ConnectionRefused("h1".into()).after_dispatch());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file").into();
        assert!(matches!(err, TransportError::Spawn(_)));

        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, TransportError::ConnectionReset(_)));
    }

    #[tokio::test]
    async fn test_line_stream_from_lines_is_exhausted_once() {
        let mut stream = LineStream::from_lines(vec![Ok("a".to_string()), Ok("b".to_string())]);
        assert_eq!(stream.next().await, Some(Ok("a".to_string())));
        assert_eq!(stream.next_line().await, Some(Ok("b".to_string())));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_raw_output_success() {
        assert!(RawOutput::new(0, "ok", "").success());
        assert!(!RawOutput::new(1, "", "boom").success());
    }
}
