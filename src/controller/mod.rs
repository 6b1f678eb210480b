//! # Container Controller
//!
//! Top-level entry point: turns an [`OperationRequest`] into an
//! [`OperationResult`] by composing the translator, the connection manager,
//! the executor and the retry policy.
//!
//! ## Pipeline
//!
//! ```text
//! OperationRequest
//!        ↓
//!   Translator::translate ──── InvalidRequest
//!        ↓
//!   ConnectionManager::acquire ──── HostUnreachable / DeadlineExceeded
//!        ↓
//!   ┌─ RetryPolicy::run_with ─────────────────────────┐
//!   │  ensure_connected → CommandExecutor::execute    │ transient: back off, retry
//!   │                   → OutputParser::parse         │
//!   └─────────────────────────────────────────────────┘
//!        ↓
//!   StateCache update (still inside the host's critical section)
//!        ↓
//!   release → OperationResult
//! ```
//!
//! ## Failure surfaces
//!
//! - Transport failures that outlast the retry budget become
//!   [`FailureKind::HostUnreachable`].
//! - Runtime hiccups (daemon unreachable, reset) that outlast it become
//!   [`FailureKind::TransientCommandFailure`].
//! - Recognized runtime errors (`No such container`, ...) are permanent and
//!   surface after a single attempt.
//! - Unreadable output becomes [`FailureKind::UnexpectedOutput`] with the raw
//!   output attached.
//! - A deadline that passes after a mutating command was sent yields
//!   [`FailureKind::Ambiguous`] carrying the last known cached state.
//! - So does an exec whose answer was lost in transit: it is never sent a
//!   second time.
//!
//! Only dispatch is retried. Start and stop are not idempotent on the remote
//! side, so a retried dispatch relies on the parsers reading "already
//! running"/"not running" as success. A `run` retried after a lost answer
//! that finds its name taken re-inspects the container instead of reporting
//! a conflict.

use crate::config::ControllerConfig;
use crate::connection::{AcquireError, ConnectionGuard, ConnectionManager, HostConnectionStatus};
use crate::executor::{CommandExecutor, ExecutionResult, ExecutorTelemetry};
use crate::host::{ContainerRef, Host, HostId};
use crate::retry::{Attempted, FailureClass, RetryPolicy};
use crate::state::{CacheEntry, ContainerState, Observation, StateCache};
use crate::translator::{
    CommandError, CommandSpec, LogOptions, OperationKind, OperationOutput, Translator,
};
use crate::transport::{LineStream, RawOutput, RemoteCommand, Transport, TransportError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod logs;
mod stats;
mod types;

pub use logs::LogStream;
pub use stats::ControllerStatistics;
pub use types::{Diagnostics, Failure, FailureKind, OperationRequest, OperationResult};

use types::last_line;

/// Why one dispatch attempt did not produce a readable answer.
#[derive(Debug)]
enum DispatchError {
    Transport(TransportError),
    /// Runtime reported a transient failure
    Runtime(RawOutput),
    /// Reconnect between attempts gave up
    Unreachable(AcquireError),
    /// Answer lost after sending a command that must not be sent twice
    Interrupted(TransportError),
    /// A retried `run` found the name taken and could not inspect it
    Unconfirmed(String),
}

impl DispatchError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Transport(e) => e.class(),
            Self::Runtime(_) => FailureClass::Transient,
            Self::Unreachable(_) | Self::Interrupted(_) | Self::Unconfirmed(_) => {
                FailureClass::Permanent
            }
        }
    }
}

/// A command that ran and whose output was read.
struct Dispatched {
    raw: RawOutput,
    parsed: Result<OperationOutput, CommandError>,
}

/// Shared with the in-flight work so an expired deadline can tell what
/// already happened.
#[derive(Default)]
struct Progress {
    dispatched: AtomicBool,
    /// An earlier attempt's command may have run without us seeing the answer
    answer_lost: AtomicBool,
    attempts: AtomicU32,
}

struct Settled {
    outcome: Result<OperationOutput, Failure>,
    raw: Option<RawOutput>,
}

impl Settled {
    fn failed(failure: Failure) -> Self {
        Self {
            outcome: Err(failure),
            raw: None,
        }
    }
}

fn acquire_failure(error: AcquireError) -> Failure {
    match error {
        AcquireError::DeadlineExceeded(host) => Failure::new(
            FailureKind::DeadlineExceeded,
            format!("deadline passed while waiting for {}", host),
        ),
        unreachable @ AcquireError::HostUnreachable { .. } => {
            Failure::new(FailureKind::HostUnreachable, unreachable.to_string())
        }
    }
}

/// Controls containers on any number of hosts through one transport.
pub struct ContainerController<T: Transport> {
    connections: ConnectionManager<T>,
    executor: CommandExecutor,
    translator: Translator,
    retry: RetryPolicy,
    operation_timeout: Duration,
    cache: StateCache,
    stats: Mutex<ControllerStatistics>,
}

impl<T: Transport> ContainerController<T> {
    pub fn new(transport: Arc<T>, config: &ControllerConfig) -> Self {
        Self {
            connections: ConnectionManager::new(transport, config.connection_settings()),
            executor: CommandExecutor::new(),
            translator: Translator::new(config.runtime),
            retry: config.retry.clone(),
            operation_timeout: config.operation_timeout(),
            cache: StateCache::new(),
            stats: Mutex::new(ControllerStatistics::default()),
        }
    }

    pub fn with_transport(transport: T, config: &ControllerConfig) -> Self {
        Self::new(Arc::new(transport), config)
    }

    /// Apply one operation and report a typed outcome.
    ///
    /// Never panics or returns early on a remote-side failure; every failure
    /// is described by the returned [`OperationResult`].
    pub async fn apply(&self, request: OperationRequest) -> OperationResult {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        debug!(
            "[{}] {} {} on {}",
            request_id, request.kind, request.container, request.host
        );

        let progress = Progress::default();
        let settled = match self.translator.translate(&request.container, &request.kind) {
            Err(e) => Settled::failed(Failure::new(FailureKind::InvalidRequest, e.to_string())),
            Ok(spec) => {
                let work = self.execute_request(&request, &spec, &progress);
                match request.deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                        Ok(settled) => settled,
                        Err(_) => self.deadline_expired(&request, &progress),
                    },
                    None => work.await,
                }
            }
        };

        let result = OperationResult {
            request_id,
            host: request.host.id().clone(),
            state: self
                .cache
                .get(request.host.id(), &request.container)
                .map(|cached| cached.state),
            container: request.container,
            operation: request.kind.name().to_string(),
            diagnostics: settled.raw.as_ref().map(Diagnostics::from_raw),
            outcome: settled.outcome,
            attempts: progress.attempts.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
        };

        match &result.outcome {
            Ok(_) => info!(
                "[{}] {} {} on {}: ok ({} attempt(s), {:?})",
                result.request_id,
                result.operation,
                result.container,
                result.host,
                result.attempts,
                result.elapsed
            ),
            Err(failure) => warn!(
                "[{}] {} {} on {}: {} ({} attempt(s), {:?})",
                result.request_id,
                result.operation,
                result.container,
                result.host,
                failure,
                result.attempts,
                result.elapsed
            ),
        }

        self.stats.lock().await.record(&result);
        result
    }

    /// Apply several operations concurrently.
    ///
    /// Operations on different hosts run in parallel; operations on the same
    /// host queue on its connection. Results come back in input order and a
    /// failure never aborts the others.
    pub async fn apply_all(&self, requests: Vec<OperationRequest>) -> Vec<OperationResult> {
        futures::future::join_all(requests.into_iter().map(|request| self.apply(request))).await
    }

    async fn execute_request(
        &self,
        request: &OperationRequest,
        spec: &CommandSpec,
        progress: &Progress,
    ) -> Settled {
        let guard = match self.connections.acquire(&request.host, None).await {
            Ok(guard) => guard,
            Err(error) => {
                if let AcquireError::HostUnreachable { attempts, .. } = &error {
                    progress.attempts.store(*attempts, Ordering::Relaxed);
                }
                return Settled::failed(acquire_failure(error));
            }
        };

        let (guard, result) = self
            .retry
            .run_with(guard, DispatchError::class, move |guard, attempt| {
                self.attempt(guard, attempt, request, spec, progress)
            })
            .await;

        let settled = match result {
            Ok(Attempted {
                value: Dispatched { raw, parsed },
                ..
            }) => self.settle(request, raw, parsed),
            Err(error) => {
                let attempts = error.attempts();
                match error.into_inner() {
                    DispatchError::Transport(e) => Settled::failed(Failure::new(
                        FailureKind::HostUnreachable,
                        format!("{} (after {} attempt(s))", e, attempts),
                    )),
                    DispatchError::Unreachable(e) => Settled::failed(acquire_failure(e)),
                    DispatchError::Interrupted(e) => Settled::failed(Failure::new(
                        FailureKind::Ambiguous {
                            last_known: self.cache.state(request.host.id(), &request.container),
                        },
                        format!("{} after the command was sent; not sent again", e),
                    )),
                    DispatchError::Unconfirmed(detail) => Settled::failed(Failure::new(
                        FailureKind::Ambiguous {
                            last_known: self.cache.state(request.host.id(), &request.container),
                        },
                        detail,
                    )),
                    DispatchError::Runtime(raw) => {
                        let detail = last_line(&raw.stderr)
                            .or_else(|| last_line(&raw.stdout))
                            .unwrap_or("no output")
                            .to_string();
                        Settled {
                            outcome: Err(Failure::new(
                                FailureKind::TransientCommandFailure,
                                format!(
                                    "{} after {} attempt(s): {}",
                                    CommandError::Transient,
                                    attempts,
                                    detail
                                ),
                            )),
                            raw: Some(raw),
                        }
                    }
                }
            }
        };

        drop(guard);
        settled
    }

    async fn attempt(
        &self,
        mut guard: ConnectionGuard<T>,
        attempt: u32,
        request: &OperationRequest,
        spec: &CommandSpec,
        progress: &Progress,
    ) -> (ConnectionGuard<T>, Result<Dispatched, DispatchError>) {
        progress.attempts.store(attempt, Ordering::Relaxed);

        if attempt > 1 {
            if let Err(e) = guard.ensure_connected().await {
                return (guard, Err(DispatchError::Unreachable(e)));
            }
        }

        progress.dispatched.store(true, Ordering::Relaxed);
        let execution = match self
            .executor
            .execute(&mut guard, &spec.command, self.operation_timeout)
            .await
        {
            Ok(execution) => execution,
            Err(e) if e.after_dispatch() => {
                progress.answer_lost.store(true, Ordering::Relaxed);
                if request.kind.is_retry_safe() {
                    return (guard, Err(DispatchError::Transport(e)));
                }
                warn!(
                    "{} {} on {}: answer lost after dispatch ({}), not sending it again",
                    request.kind, request.container, request.host, e
                );
                return (guard, Err(DispatchError::Interrupted(e)));
            }
            Err(e) => return (guard, Err(DispatchError::Transport(e))),
        };

        let raw = RawOutput::new(execution.exit_code, execution.stdout, execution.stderr);
        let result = match spec.parser.parse(&raw) {
            Err(CommandError::Transient) => {
                debug!(
                    "Runtime on {} reported a transient failure: {}",
                    guard.host(),
                    raw.stderr.trim()
                );
                Err(DispatchError::Runtime(raw))
            }
            Err(CommandError::AlreadyExists)
                if request.kind.creates() && progress.answer_lost.load(Ordering::Relaxed) =>
            {
                self.confirm_created(&mut guard, request).await
            }
            parsed => Ok(Dispatched { raw, parsed }),
        };
        (guard, result)
    }

    /// The earlier `run` may have created the container before its answer
    /// was lost; report what is there now rather than a name conflict.
    async fn confirm_created(
        &self,
        guard: &mut ConnectionGuard<T>,
        request: &OperationRequest,
    ) -> Result<Dispatched, DispatchError> {
        warn!(
            "{} already exists on {} after an interrupted run, inspecting it",
            request.container, request.host
        );
        let inspect = self.translator.inspect(&request.container);
        let execution = self
            .executor
            .execute(guard, &inspect.command, self.operation_timeout)
            .await
            .map_err(|e| {
                DispatchError::Unconfirmed(format!(
                    "{} exists after an interrupted run but could not be inspected: {}",
                    request.container, e
                ))
            })?;

        let raw = RawOutput::new(execution.exit_code, execution.stdout, execution.stderr);
        match inspect.parser.parse(&raw) {
            Ok(output) => Ok(Dispatched {
                raw,
                parsed: Ok(output),
            }),
            Err(e) => Err(DispatchError::Unconfirmed(format!(
                "{} exists after an interrupted run but could not be inspected: {}",
                request.container, e
            ))),
        }
    }

    /// Fold a parsed answer into the cache and the outcome.
    fn settle(
        &self,
        request: &OperationRequest,
        raw: RawOutput,
        parsed: Result<OperationOutput, CommandError>,
    ) -> Settled {
        let host = request.host.id();
        let container = &request.container;

        let outcome = match parsed {
            Ok(output) => {
                if let Some(state) = output.state() {
                    let how = if request.kind.creates() {
                        Observation::Create
                    } else {
                        Observation::Report
                    };
                    self.cache.observe(host, container, state.clone(), how);
                }
                Ok(output)
            }
            Err(error) => {
                match &error {
                    // Exec and put answers never speak for the container's existence.
                    CommandError::NotFound
                        if !matches!(request.kind, OperationKind::Exec(_) | OperationKind::Put(_)) =>
                    {
                        self.cache.mark_missing(host, container);
                    }
                    CommandError::Failed { .. }
                        if request.kind.reports_state() && request.kind.is_mutating() =>
                    {
                        let detail = last_line(&raw.stderr).unwrap_or("command failed");
                        self.cache.observe(
                            host,
                            container,
                            ContainerState::Error(detail.to_string()),
                            Observation::Report,
                        );
                    }
                    _ => {}
                }

                let message = match last_line(&raw.stderr) {
                    Some(line) => format!("{}: {}", error, line),
                    None => error.to_string(),
                };
                Err(Failure::new(FailureKind::from(&error), message))
            }
        };

        Settled {
            outcome,
            raw: Some(raw),
        }
    }

    fn deadline_expired(&self, request: &OperationRequest, progress: &Progress) -> Settled {
        let dispatched = progress.dispatched.load(Ordering::Relaxed);

        if dispatched && request.kind.is_mutating() {
            let last_known = self.cache.state(request.host.id(), &request.container);
            warn!(
                "{} {} on {} cancelled after dispatch; outcome unknown",
                request.kind, request.container, request.host
            );
            return Settled::failed(Failure::new(
                FailureKind::Ambiguous { last_known },
                "deadline passed after the command was sent",
            ));
        }

        let stage = if dispatched {
            "waiting for the response"
        } else {
            "before dispatch"
        };
        Settled::failed(Failure::new(
            FailureKind::DeadlineExceeded,
            format!("deadline passed {}", stage),
        ))
    }

    /// Follow a container's logs.
    ///
    /// Checks the container exists, then opens `logs --follow` on the host's
    /// connection. Only opening the stream is serialized with other
    /// operations on the host; the stream then runs on its own channel and
    /// ends at the deadline, if one is given.
    pub async fn stream_logs(
        &self,
        host: &Host,
        container: &ContainerRef,
        options: LogOptions,
        deadline: Option<Instant>,
    ) -> Result<LogStream, Failure> {
        let mut check = OperationRequest::new(host.clone(), container.clone(), OperationKind::Inspect);
        check.deadline = deadline;
        let checked = self.apply(check).await;
        if let Err(failure) = checked.outcome {
            return Err(failure);
        }

        let line = self.translator.logs_line(container, &options, true);
        let open = self.open_log_stream(host, container, &line);
        let lines = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, open).await.map_err(|_| {
                Failure::new(FailureKind::DeadlineExceeded, "deadline passed opening log stream")
            })??,
            None => open.await?,
        };

        Ok(LogStream::new(lines, options.timestamps, deadline))
    }

    async fn open_log_stream(
        &self,
        host: &Host,
        container: &ContainerRef,
        line: &str,
    ) -> Result<LineStream, Failure> {
        let mut guard = self
            .connections
            .acquire(host, None)
            .await
            .map_err(acquire_failure)?;

        let opened = match guard.session() {
            Some(session) => {
                tokio::time::timeout(
                    self.operation_timeout,
                    guard.transport().open_stream(session, line),
                )
                .await
            }
            None => Ok(Err(TransportError::NotConnected(host.id().clone()))),
        };

        match opened {
            Ok(Ok(lines)) => {
                info!("Following logs of {} on {}", container, host);
                Ok(lines)
            }
            Ok(Err(e)) => {
                guard.invalidate().await;
                Err(Failure::new(FailureKind::HostUnreachable, e.to_string()))
            }
            Err(_) => {
                guard.mark_for_health_check();
                Err(Failure::new(
                    FailureKind::HostUnreachable,
                    TransportError::Timeout(self.operation_timeout).to_string(),
                ))
            }
        }
    }

    /// Run a command directly on `host`, outside any container.
    ///
    /// Queues on the host's connection like any container operation.
    /// Connecting is retried, the command itself is sent at most once, and
    /// a non-zero exit is a result. `deadline` bounds the wait for the
    /// connection and the command.
    pub async fn run_on_host(
        &self,
        host: &Host,
        command: &RemoteCommand,
        deadline: Option<Instant>,
    ) -> Result<ExecutionResult, Failure> {
        let mut guard = self
            .connections
            .acquire(host, deadline)
            .await
            .map_err(acquire_failure)?;

        let timeout = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.operation_timeout),
            None => self.operation_timeout,
        };

        match self.executor.execute(&mut guard, command, timeout).await {
            Ok(execution) => {
                info!(
                    "Host command on {} exited with {} ({:?})",
                    host, execution.exit_code, execution.duration
                );
                Ok(execution)
            }
            Err(e) if e.after_dispatch() => Err(Failure::new(
                FailureKind::Ambiguous {
                    last_known: ContainerState::Unknown,
                },
                format!("{} after the command was sent", e),
            )),
            Err(e) => Err(Failure::new(FailureKind::HostUnreachable, e.to_string())),
        }
    }

    /// Last observed state; `Unknown` when never observed. May be stale.
    pub fn cached_state(&self, host: &HostId, container: &ContainerRef) -> ContainerState {
        self.cache.state(host, container)
    }

    pub fn cache_snapshot(&self) -> Vec<CacheEntry> {
        self.cache.snapshot()
    }

    /// Forget the cached state of one container.
    pub fn invalidate(&self, host: &HostId, container: &ContainerRef) -> bool {
        self.cache.invalidate(host, container)
    }

    /// Forget every cached state on one host.
    pub fn invalidate_host(&self, host: &HostId) -> usize {
        self.cache.invalidate_host(host)
    }

    pub fn connections(&self) -> &ConnectionManager<T> {
        &self.connections
    }

    pub fn connection_status(&self) -> Vec<HostConnectionStatus> {
        self.connections.status()
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn executor_telemetry(&self) -> ExecutorTelemetry {
        self.executor.telemetry()
    }

    pub async fn stats(&self) -> ControllerStatistics {
        self.stats.lock().await.clone()
    }

    /// Close every host connection.
    pub async fn disconnect_all(&self) {
        self.connections.disconnect_all().await;
    }
}
