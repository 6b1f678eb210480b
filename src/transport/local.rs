//! Local shell transport.
//!
//! Runs command lines through `sh -c` on the controller's own machine, for a
//! container runtime that lives next to the controller. There is no real
//! connection to establish, so connecting and health checks always succeed.

use super::process::{run_process, stream_process};
use super::{LineStream, RawOutput, RemoteCommand, Transport, TransportError};
use crate::host::{Host, HostId};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Executes commands directly on the local system
#[derive(Debug, Clone)]
pub struct LocalTransport {
    shell: String,
}

/// Session marker for the local transport.
#[derive(Debug, Clone)]
pub struct LocalSession {
    host: HostId,
}

impl LocalTransport {
    /// Create a local transport using `/bin/sh`
    pub fn new() -> Self {
        Self::with_shell("sh")
    }

    /// Use a different POSIX shell
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    type Session = LocalSession;

    async fn connect(&self, host: &Host) -> Result<LocalSession, TransportError> {
        debug!("Using local shell for {}", host);
        Ok(LocalSession {
            host: host.id().clone(),
        })
    }

    async fn run(
        &self,
        session: &LocalSession,
        command: &RemoteCommand,
    ) -> Result<RawOutput, TransportError> {
        debug!("local {}: {}", session.host, command.line);
        run_process(
            &self.shell,
            &["-c".to_string(), command.line.clone()],
            command.stdin.as_deref(),
        )
        .await
    }

    async fn open_stream(
        &self,
        session: &LocalSession,
        command_line: &str,
    ) -> Result<LineStream, TransportError> {
        debug!("local stream {}: {}", session.host, command_line);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command_line);
        // No connection can break underneath a local child.
        stream_process(cmd, |_, _| None)
    }

    async fn health_check(&self, _session: &LocalSession) -> Result<(), TransportError> {
        // Local shell is always available
        Ok(())
    }

    async fn disconnect(&self, _session: LocalSession) {}

    fn transport_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_runs_command() {
        let transport = LocalTransport::new();
        let session = transport.connect(&Host::new("localhost")).await.unwrap();

        let output = transport
            .run(&session, &RemoteCommand::new("echo 'Hello World'"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "Hello World\n");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_local_transport_non_zero_exit_is_not_an_error() {
        let transport = LocalTransport::new();
        let session = transport.connect(&Host::new("localhost")).await.unwrap();

        let output = transport
            .run(&session, &RemoteCommand::new("echo 'No such container: ghost' >&2; exit 1"))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("No such container"));
    }

    #[tokio::test]
    async fn test_local_transport_stdin() {
        let transport = LocalTransport::new();
        let session = transport.connect(&Host::new("localhost")).await.unwrap();

        let output = transport
            .run(
                &session,
                &RemoteCommand::new("wc -c").with_stdin(b"12345".to_vec()),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "5");
    }

    #[tokio::test]
    async fn test_local_transport_stream() {
        let transport = LocalTransport::new();
        let session = transport.connect(&Host::new("localhost")).await.unwrap();

        let mut stream = transport
            .open_stream(&session, "echo first; echo second")
            .await
            .unwrap();
        assert_eq!(stream.next_line().await, Some(Ok("first".to_string())));
        assert_eq!(stream.next_line().await, Some(Ok("second".to_string())));
        assert_eq!(stream.next_line().await, None);
        assert!(transport.health_check(&session).await.is_ok());
        assert_eq!(transport.transport_type(), "local");
    }
}
