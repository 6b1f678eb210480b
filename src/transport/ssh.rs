//! OpenSSH transport.
//!
//! Each host gets one persistent master connection (`ControlMaster`), opened
//! by [`SshTransport::connect`]. Commands are multiplexed over the master's
//! control socket, so a command costs a channel open rather than a full
//! handshake. The system `ssh` client does the protocol work, which keeps the
//! user's `~/.ssh/config`, agent and known-hosts handling intact.

use super::process::{run_process, stream_process};
use super::{LineStream, RawOutput, RemoteCommand, Transport, TransportError};
use crate::host::{CredentialRef, Host, HostId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit status the OpenSSH client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Options for the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Handshake timeout (`ConnectTimeout`)
    pub connect_timeout: Duration,
    /// Directory for control sockets; keep it short, socket paths are limited
    pub control_dir: PathBuf,
    /// Extra `-o Key=Value` options appended to every invocation
    pub extra_options: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(crate::env::defaults::CONNECT_TIMEOUT_SECS),
            control_dir: std::env::temp_dir(),
            extra_options: Vec::new(),
        }
    }
}

/// Transport backed by the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    options: SshOptions,
}

/// A live master connection to one host.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: HostId,
    destination: String,
    port: Option<u16>,
    control_path: PathBuf,
    established_at: DateTime<Utc>,
}

impl SshSession {
    pub fn host(&self) -> &HostId {
        &self.host
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl SshTransport {
    /// Locate the `ssh` client on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Spawn`] if no `ssh` binary is installed.
    pub fn new(options: SshOptions) -> Result<Self, TransportError> {
        let program = which::which("ssh")
            .map_err(|e| TransportError::Spawn(format!("ssh client not found: {}", e)))?;
        Ok(Self {
            program: program.display().to_string(),
            options,
        })
    }

    /// Use an explicit client binary (e.g. a wrapper script).
    pub fn with_program(program: impl Into<String>, options: SshOptions) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    fn control_path_for(&self, host: &Host) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        host.id().hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        Utc::now().timestamp_nanos_opt().unwrap_or_default().hash(&mut hasher);
        self.options
            .control_dir
            .join(format!("jumphost-ssh-{:x}.sock", hasher.finish()))
    }

    fn common_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
        ];
        for option in &self.options.extra_options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    /// Arguments that open a backgrounded master connection.
    fn master_args(&self, host: &Host, control_path: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "-MNf".to_string(),
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
        ];
        args.extend(self.common_options());
        if let Some(port) = host.port() {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(CredentialRef::IdentityFile { path }) = host.credentials() {
            args.push("-i".to_string());
            args.push(path.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.push(host.destination());
        args
    }

    /// Arguments that run one command over an existing master.
    fn session_args(&self, session: &SshSession, command_line: &str) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-S".to_string(),
            session.control_path.display().to_string(),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
        ];
        args.extend(self.common_options());
        if let Some(port) = session.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(session.destination.clone());
        args.push(command_line.to_string());
        args
    }

    fn control_args(&self, session: &SshSession, op: &str) -> Vec<String> {
        vec![
            "-S".to_string(),
            session.control_path.display().to_string(),
            "-O".to_string(),
            op.to_string(),
            session.destination.clone(),
        ]
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Session = SshSession;

    async fn connect(&self, host: &Host) -> Result<SshSession, TransportError> {
        let control_path = self.control_path_for(host);
        debug!(
            "Opening ssh master to {} (control socket {:?})",
            host,
            control_path
        );

        let output = run_process(&self.program, &self.master_args(host, &control_path), None).await?;
        if !output.success() {
            let _ = std::fs::remove_file(&control_path);
            return Err(classify_ssh_failure(
                host.address(),
                &output.stderr,
                self.options.connect_timeout,
            ));
        }

        info!("Connected to {} over ssh", host);
        Ok(SshSession {
            host: host.id().clone(),
            destination: host.destination(),
            port: host.port(),
            control_path,
            established_at: Utc::now(),
        })
    }

    async fn run(
        &self,
        session: &SshSession,
        command: &RemoteCommand,
    ) -> Result<RawOutput, TransportError> {
        debug!("ssh {}: {}", session.host, command.line);
        let output = run_process(
            &self.program,
            &self.session_args(session, &command.line),
            command.stdin.as_deref(),
        )
        .await?;

        // 255 is also a legal remote exit code; a client failure always
        // leaves an ssh diagnostic on stderr, a remote 255 usually does not.
        if output.exit_code == SSH_CLIENT_FAILURE && looks_like_client_failure(&output.stderr) {
            return Err(classify_ssh_failure(
                session.host.as_str(),
                &output.stderr,
                self.options.connect_timeout,
            ));
        }
        Ok(output)
    }

    async fn open_stream(
        &self,
        session: &SshSession,
        command_line: &str,
    ) -> Result<LineStream, TransportError> {
        debug!("ssh stream {}: {}", session.host, command_line);
        let mut cmd = Command::new(&self.program);
        cmd.args(self.session_args(session, command_line));

        let host = session.host.to_string();
        let timeout = self.options.connect_timeout;
        stream_process(cmd, move |code, stderr| {
            (code == SSH_CLIENT_FAILURE && looks_like_client_failure(stderr))
                .then(|| classify_ssh_failure(&host, stderr, timeout))
        })
    }

    async fn health_check(&self, session: &SshSession) -> Result<(), TransportError> {
        let output = run_process(&self.program, &self.control_args(session, "check"), None).await?;
        if output.success() {
            Ok(())
        } else {
            Err(TransportError::ConnectionReset(format!(
                "master connection to {} is gone: {}",
                session.host,
                output.stderr.trim()
            )))
        }
    }

    async fn disconnect(&self, session: SshSession) {
        debug!("Closing ssh master to {}", session.host);
        match run_process(&self.program, &self.control_args(&session, "exit"), None).await {
            Ok(output) if !output.success() => {
                debug!(
                    "ssh -O exit for {} returned {}: {}",
                    session.host,
                    output.exit_code,
                    output.stderr.trim()
                );
            }
            Err(e) => warn!("Failed to close ssh master to {}: {}", session.host, e),
            _ => {}
        }
        if let Err(e) = std::fs::remove_file(&session.control_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("Could not remove control socket {:?}: {}", session.control_path, e);
        }
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}

fn looks_like_client_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("ssh:")
        || lower.contains("connection")
        || lower.contains("permission denied")
        || lower.contains("host key")
        || lower.contains("control socket")
        || lower.contains("mux_client")
}

/// Map an OpenSSH client diagnostic to a [`TransportError`].
pub fn classify_ssh_failure(host: &str, stderr: &str, connect_timeout: Duration) -> TransportError {
    let detail = stderr.trim().to_string();
    let lower = detail.to_lowercase();

    if lower.contains("could not resolve hostname")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("temporary failure in name resolution")
    {
        TransportError::DnsLookup {
            host: host.to_string(),
            detail,
        }
    } else if lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
        || lower.contains("no supported authentication methods")
    {
        TransportError::AuthenticationFailed {
            host: host.to_string(),
            detail,
        }
    } else if lower.contains("connection refused") {
        TransportError::ConnectionRefused(format!("{}: {}", host, detail))
    } else if lower.contains("timed out") {
        TransportError::Timeout(connect_timeout)
    } else if lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("closed by remote host")
        || lower.contains("connection closed")
        || lower.contains("control socket")
        || lower.contains("mux_client")
    {
        TransportError::ConnectionReset(format!("{}: {}", host, detail))
    } else {
        TransportError::Protocol(format!("ssh to {} failed: {}", host, detail))
    }
}
