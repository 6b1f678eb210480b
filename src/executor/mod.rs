//! # Command Executor
//!
//! Runs one fully formed command over a held connection and reports what
//! happened, with no interpretation of the output.
//!
//! ## Responsibilities
//!
//! - Refuses to dispatch unless the connection is `Connected`
//! - Applies the per-command timeout around the transport call
//! - Marks the connection for a health check when a command times out
//!   (the remote side may still be busy with it)
//! - Invalidates the connection on any other transport failure
//! - Keeps timing telemetry; otherwise stateless between calls
//!
//! A non-zero exit code is an ordinary [`ExecutionResult`], never an error.
//!
//! ```text
//! RemoteCommand ──▶ CommandExecutor::execute(&mut guard) ──▶ Transport::run
//!                                │                               │
//!                                │◀──────── RawOutput ───────────┘
//!                                ▼
//!                         ExecutionResult
//! ```

use crate::connection::{ConnectionGuard, ConnectionState};
use crate::transport::{RemoteCommand, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Exit code (0 = success, non-zero = failure)
    pub exit_code: i32,
    /// Duration of command execution
    pub duration: Duration,
}

impl ExecutionResult {
    /// Check if the command executed successfully (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Aggregate timing across every dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorTelemetry {
    pub dispatched: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub transport_failures: u64,
    pub total_duration: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    transport_failures: AtomicU64,
    total_micros: AtomicU64,
}

/// Dispatches commands over connections it does not own.
#[derive(Debug, Default)]
pub struct CommandExecutor {
    counters: Counters,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command` on the connection held by `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] if the guard holds no live session,
    /// [`TransportError::Timeout`] if `timeout` elapses, or whatever the
    /// transport reported.
    pub async fn execute<T: Transport>(
        &self,
        conn: &mut ConnectionGuard<T>,
        command: &RemoteCommand,
        timeout: Duration,
    ) -> Result<ExecutionResult, TransportError> {
        if conn.state() != ConnectionState::Connected || conn.session().is_none() {
            return Err(TransportError::NotConnected(conn.host().id().clone()));
        }

        debug!("Dispatching to {}: {}", conn.host(), command.line);
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let start = Instant::now();
        conn.begin_dispatch();
        let outcome = match conn.session() {
            Some(session) => {
                tokio::time::timeout(timeout, conn.transport().run(session, command)).await
            }
            None => Ok(Err(TransportError::NotConnected(conn.host().id().clone()))),
        };
        conn.end_dispatch();
        let duration = start.elapsed();
        self.counters
            .total_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        match outcome {
            Ok(Ok(raw)) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Command on {} exited with {} after {:?}",
                    conn.host(),
                    raw.exit_code,
                    duration
                );
                Ok(ExecutionResult {
                    stdout: raw.stdout,
                    stderr: raw.stderr,
                    exit_code: raw.exit_code,
                    duration,
                })
            }
            Ok(Err(error)) => {
                self.counters
                    .transport_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Transport failure on {}: {}", conn.host(), error);
                conn.invalidate().await;
                Err(error)
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Command on {} timed out after {:?}: {}",
                    conn.host(),
                    timeout,
                    command.line
                );
                conn.mark_for_health_check();
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    pub fn telemetry(&self) -> ExecutorTelemetry {
        ExecutorTelemetry {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            transport_failures: self.counters.transport_failures.load(Ordering::Relaxed),
            total_duration: Duration::from_micros(
                self.counters.total_micros.load(Ordering::Relaxed),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, ConnectionSettings};
    use crate::host::Host;
    use crate::transport::{ScriptedReply, ScriptedTransport};
    use std::sync::Arc;

    fn manager(transport: &ScriptedTransport) -> ConnectionManager<ScriptedTransport> {
        ConnectionManager::new(Arc::new(transport.clone()), ConnectionSettings::default())
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_result() {
        let transport = ScriptedTransport::new();
        transport.push_reply("h1", ScriptedReply::exit(1, "", "Error: No such container: ghost"));
        let manager = manager(&transport);
        let executor = CommandExecutor::new();

        let mut conn = manager.acquire(&Host::new("h1"), None).await.unwrap();
        let result = executor
            .execute(&mut conn, &RemoteCommand::new("docker stop ghost"), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(!result.success());
        assert!(result.stderr.contains("No such container"));
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_timeout_marks_health_check() {
        let transport = ScriptedTransport::new();
        transport.push_reply("h1", ScriptedReply::ok("late").after(Duration::from_secs(5)));
        let manager = manager(&transport);
        let executor = CommandExecutor::new();

        let mut conn = manager.acquire(&Host::new("h1"), None).await.unwrap();
        let err = executor
            .execute(&mut conn, &RemoteCommand::new("sleep 5"), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert_eq!(err, TransportError::Timeout(Duration::from_millis(20)));
        assert!(conn.needs_health_check());
        assert_eq!(executor.telemetry().timed_out, 1);
    }

    #[tokio::test]
    async fn test_transport_error_invalidates_connection() {
        let transport = ScriptedTransport::new();
        transport.push_reply(
            "h1",
            ScriptedReply::error(TransportError::ConnectionReset("eof".into())),
        );
        let manager = manager(&transport);
        let executor = CommandExecutor::new();

        let mut conn = manager.acquire(&Host::new("h1"), None).await.unwrap();
        let err = executor
            .execute(&mut conn, &RemoteCommand::new("docker ps"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionReset(_)));
        assert_eq!(conn.state(), ConnectionState::Broken);

        let again = executor
            .execute(&mut conn, &RemoteCommand::new("docker ps"), Duration::from_secs(1))
            .await;
        assert!(matches!(again, Err(TransportError::NotConnected(_))));
        assert_eq!(transport.run_count("h1"), 1);
    }

    #[tokio::test]
    async fn test_telemetry_counts_dispatches() {
        let transport = ScriptedTransport::new();
        transport.set_fallback("h1", ScriptedReply::ok("ok\n"));
        let manager = manager(&transport);
        let executor = CommandExecutor::new();

        let mut conn = manager.acquire(&Host::new("h1"), None).await.unwrap();
        for _ in 0..3 {
            executor
                .execute(&mut conn, &RemoteCommand::new("true"), Duration::from_secs(1))
                .await
                .unwrap();
        }
        let telemetry = executor.telemetry();
        assert_eq!(telemetry.dispatched, 3);
        assert_eq!(telemetry.completed, 3);
        assert_eq!(telemetry.transport_failures, 0);
    }
}
