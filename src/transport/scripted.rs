//! Deterministic transport driven by queued replies.
//!
//! Each host has a queue of [`ScriptedReply`] values consumed in order by
//! `run` and `open_stream`, plus optional queues for connect and health-check
//! outcomes. Every call is recorded, and the transport tracks how many
//! commands were in flight per host at once so tests can assert that no
//! channel ever carries two commands concurrently.

use super::{LineStream, RawOutput, RemoteCommand, Transport, TransportError};
use crate::host::{Host, HostId};
use crate::translator::EXEC_STARTED;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// What a scripted call answers with.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Command completed with this output
    Output(RawOutput),
    /// Transport-level failure
    Error(TransportError),
    /// Answer with the inner reply after a pause
    Delayed(Duration, Box<ScriptedReply>),
    /// Stream (or stdout) lines
    Lines(Vec<String>),
}

impl ScriptedReply {
    /// Exit code 0 with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::Output(RawOutput::new(0, stdout, ""))
    }

    /// Arbitrary exit code, stdout and stderr.
    pub fn exit(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Output(RawOutput::new(code, stdout, stderr))
    }

    /// Answer of an exec whose command started: the runtime's start marker
    /// precedes the command's own stderr.
    pub fn exec(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let stderr = format!("{}\n{}", EXEC_STARTED, stderr.into());
        Self::Output(RawOutput::new(code, stdout, stderr))
    }

    pub fn error(error: TransportError) -> Self {
        Self::Error(error)
    }

    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lines(lines.into_iter().map(Into::into).collect())
    }

    /// Delay this reply.
    pub fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }
}

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Connect { host: HostId },
    Run { host: HostId, line: String, stdin: Option<Vec<u8>> },
    Stream { host: HostId, line: String },
    HealthCheck { host: HostId },
    Disconnect { host: HostId },
}

#[derive(Debug, Default)]
struct ScriptState {
    connect: HashMap<HostId, VecDeque<Result<(), TransportError>>>,
    replies: HashMap<HostId, VecDeque<ScriptedReply>>,
    fallback: HashMap<HostId, ScriptedReply>,
    health: HashMap<HostId, VecDeque<Result<(), TransportError>>>,
    connect_delay: HashMap<HostId, Duration>,
    calls: Vec<RecordedCall>,
    in_flight: HashMap<HostId, usize>,
    max_in_flight: HashMap<HostId, usize>,
    next_generation: u64,
}

/// Transport whose answers are queued up front.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

/// Session handed out by [`ScriptedTransport`]; the generation increases on
/// every successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedSession {
    pub host: HostId,
    pub generation: u64,
}

/// Decrements the in-flight counter even if the call is cancelled.
struct InFlight {
    state: Arc<Mutex<ScriptState>>,
    host: HostId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(count) = state.in_flight.get_mut(&self.host) {
            *count = count.saturating_sub(1);
        }
    }
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    // A panicking test thread must not hide the script from other tests.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next `run`/`open_stream` on `host`.
    pub fn push_reply(&self, host: impl Into<HostId>, reply: ScriptedReply) {
        lock(&self.state)
            .replies
            .entry(host.into())
            .or_default()
            .push_back(reply);
    }

    /// Answer used once the queue for `host` is empty.
    pub fn set_fallback(&self, host: impl Into<HostId>, reply: ScriptedReply) {
        lock(&self.state).fallback.insert(host.into(), reply);
    }

    /// Queue the outcome of the next connect to `host` (default: success).
    pub fn push_connect_result(&self, host: impl Into<HostId>, result: Result<(), TransportError>) {
        lock(&self.state)
            .connect
            .entry(host.into())
            .or_default()
            .push_back(result);
    }

    /// Make every handshake with `host` take `delay`.
    pub fn set_connect_delay(&self, host: impl Into<HostId>, delay: Duration) {
        lock(&self.state).connect_delay.insert(host.into(), delay);
    }

    /// Queue the outcome of the next health check on `host` (default: healthy).
    pub fn push_health_result(&self, host: impl Into<HostId>, result: Result<(), TransportError>) {
        lock(&self.state)
            .health
            .entry(host.into())
            .or_default()
            .push_back(result);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.state).calls.clone()
    }

    /// Command lines run on `host`, in order.
    pub fn run_lines(&self, host: impl Into<HostId>) -> Vec<String> {
        let host = host.into();
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                RecordedCall::Run { host: h, line, .. } if *h == host => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn run_count(&self, host: impl Into<HostId>) -> usize {
        self.run_lines(host).len()
    }

    pub fn connect_count(&self, host: impl Into<HostId>) -> usize {
        let host = host.into();
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, RecordedCall::Connect { host: h } if *h == host))
            .count()
    }

    pub fn health_check_count(&self, host: impl Into<HostId>) -> usize {
        let host = host.into();
        lock(&self.state)
            .calls
            .iter()
            .filter(|call| matches!(call, RecordedCall::HealthCheck { host: h } if *h == host))
            .count()
    }

    /// Highest number of commands observed in flight on `host` at once.
    pub fn max_concurrency(&self, host: impl Into<HostId>) -> usize {
        lock(&self.state)
            .max_in_flight
            .get(&host.into())
            .copied()
            .unwrap_or(0)
    }

    fn next_reply(&self, host: &HostId) -> ScriptedReply {
        let mut state = lock(&self.state);
        if let Some(reply) = state.replies.get_mut(host).and_then(VecDeque::pop_front) {
            return reply;
        }
        state.fallback.get(host).cloned().unwrap_or_else(|| {
            ScriptedReply::Error(TransportError::Protocol(format!(
                "no scripted reply left for {}",
                host
            )))
        })
    }

    fn enter(&self, host: &HostId) -> InFlight {
        let mut state = lock(&self.state);
        let count = {
            let count = state.in_flight.entry(host.clone()).or_default();
            *count += 1;
            *count
        };
        let max = state.max_in_flight.entry(host.clone()).or_default();
        *max = (*max).max(count);
        InFlight {
            state: Arc::clone(&self.state),
            host: host.clone(),
        }
    }

    fn record(&self, call: RecordedCall) {
        lock(&self.state).calls.push(call);
    }

    async fn settle(reply: ScriptedReply) -> ScriptedReply {
        let mut reply = reply;
        while let ScriptedReply::Delayed(delay, inner) = reply {
            tokio::time::sleep(delay).await;
            reply = *inner;
        }
        reply
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Session = ScriptedSession;

    async fn connect(&self, host: &Host) -> Result<ScriptedSession, TransportError> {
        self.record(RecordedCall::Connect {
            host: host.id().clone(),
        });
        let delay = lock(&self.state).connect_delay.get(host.id()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        let result = state
            .connect
            .get_mut(host.id())
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()));
        result?;
        state.next_generation += 1;
        Ok(ScriptedSession {
            host: host.id().clone(),
            generation: state.next_generation,
        })
    }

    async fn run(
        &self,
        session: &ScriptedSession,
        command: &RemoteCommand,
    ) -> Result<RawOutput, TransportError> {
        self.record(RecordedCall::Run {
            host: session.host.clone(),
            line: command.line.clone(),
            stdin: command.stdin.clone(),
        });
        let _in_flight = self.enter(&session.host);
        let reply = self.next_reply(&session.host);
        debug!("scripted {}: {} -> {:?}", session.host, command.line, reply);

        match Self::settle(reply).await {
            ScriptedReply::Output(output) => Ok(output),
            ScriptedReply::Error(error) => Err(error),
            ScriptedReply::Lines(lines) => {
                let mut stdout = lines.join("\n");
                if !stdout.is_empty() {
                    stdout.push('\n');
                }
                Ok(RawOutput::new(0, stdout, ""))
            }
            ScriptedReply::Delayed(..) => unreachable!("settle unwraps every delay"),
        }
    }

    async fn open_stream(
        &self,
        session: &ScriptedSession,
        command_line: &str,
    ) -> Result<LineStream, TransportError> {
        self.record(RecordedCall::Stream {
            host: session.host.clone(),
            line: command_line.to_string(),
        });
        let reply = self.next_reply(&session.host);

        match Self::settle(reply).await {
            ScriptedReply::Lines(lines) => Ok(LineStream::from_lines(lines.into_iter().map(Ok))),
            ScriptedReply::Output(output) => Ok(LineStream::from_lines(
                output
                    .stdout
                    .lines()
                    .map(|line| Ok(line.to_string()))
                    .collect::<Vec<_>>(),
            )),
            ScriptedReply::Error(error) => Err(error),
            ScriptedReply::Delayed(..) => unreachable!("settle unwraps every delay"),
        }
    }

    async fn health_check(&self, session: &ScriptedSession) -> Result<(), TransportError> {
        self.record(RecordedCall::HealthCheck {
            host: session.host.clone(),
        });
        lock(&self.state)
            .health
            .get_mut(&session.host)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }

    async fn disconnect(&self, session: ScriptedSession) {
        self.record(RecordedCall::Disconnect { host: session.host });
    }

    fn transport_type(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_are_consumed_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_reply("h1", ScriptedReply::ok("first"));
        transport.push_reply(
            "h1",
            ScriptedReply::error(TransportError::ConnectionReset("h1".into())),
        );

        let session = transport.connect(&Host::new("h1")).await.unwrap();
        let first = transport.run(&session, &RemoteCommand::new("a")).await;
        let second = transport.run(&session, &RemoteCommand::new("b")).await;
        let third = transport.run(&session, &RemoteCommand::new("c")).await;

        assert_eq!(first.unwrap().stdout, "first");
        assert!(matches!(second, Err(TransportError::ConnectionReset(_))));
        assert!(matches!(third, Err(TransportError::Protocol(_))));
        assert_eq!(transport.run_lines("h1"), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_fallback_and_generations() {
        let transport = ScriptedTransport::new();
        transport.set_fallback("h1", ScriptedReply::ok("again"));
        transport.push_connect_result("h1", Err(TransportError::ConnectionRefused("h1".into())));

        assert!(transport.connect(&Host::new("h1")).await.is_err());
        let first = transport.connect(&Host::new("h1")).await.unwrap();
        let second = transport.connect(&Host::new("h1")).await.unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(transport.connect_count("h1"), 3);

        for _ in 0..3 {
            let out = transport.run(&second, &RemoteCommand::new("x")).await.unwrap();
            assert_eq!(out.stdout, "again");
        }
    }

    #[tokio::test]
    async fn test_in_flight_released_on_cancel() {
        let transport = ScriptedTransport::new();
        transport.push_reply("h1", ScriptedReply::ok("late").after(Duration::from_secs(5)));
        let session = transport.connect(&Host::new("h1")).await.unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            transport.run(&session, &RemoteCommand::new("slow")),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(transport.max_concurrency("h1"), 1);
        assert_eq!(lock(&transport.state).in_flight.get(&HostId::from("h1")), Some(&0));
    }
}
