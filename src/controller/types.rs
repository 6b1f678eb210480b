//! Request and result types for the container controller.

use crate::env::defaults;
use crate::host::{ContainerRef, Host, HostId};
use crate::state::ContainerState;
use crate::translator::{CommandError, OperationKind, OperationOutput};
use crate::transport::RawOutput;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// One operation against one container on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub host: Host,
    pub container: ContainerRef,
    pub kind: OperationKind,
    /// Give up (and report why) once this instant passes
    pub deadline: Option<Instant>,
}

impl OperationRequest {
    pub fn new(host: Host, container: ContainerRef, kind: OperationKind) -> Self {
        Self {
            host,
            container,
            kind,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Stable classification of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection could not be established or repaired
    HostUnreachable,
    /// Runtime kept failing transiently until attempts ran out
    TransientCommandFailure,
    ContainerNotFound,
    ContainerAlreadyExists,
    ContainerNotRunning,
    PermissionDenied,
    /// Non-zero exit with no recognized error text
    CommandFailed { exit_code: i32 },
    /// Command succeeded but its output could not be interpreted
    UnexpectedOutput,
    /// The command was sent but its answer never arrived (deadline passed
    /// or the channel dropped); the remote side may or may not have applied
    /// the change
    Ambiguous { last_known: ContainerState },
    /// Deadline passed before anything was sent
    DeadlineExceeded,
    /// The request could not be turned into a command
    InvalidRequest,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HostUnreachable => "HostUnreachable",
            Self::TransientCommandFailure => "TransientCommandFailure",
            Self::ContainerNotFound => "ContainerNotFound",
            Self::ContainerAlreadyExists => "ContainerAlreadyExists",
            Self::ContainerNotRunning => "ContainerNotRunning",
            Self::PermissionDenied => "PermissionDenied",
            Self::CommandFailed { .. } => "CommandFailed",
            Self::UnexpectedOutput => "UnexpectedOutput",
            Self::Ambiguous { .. } => "Ambiguous",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::InvalidRequest => "InvalidRequest",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed { exit_code } => write!(f, "CommandFailed(exit {})", exit_code),
            Self::Ambiguous { last_known } => write!(f, "Ambiguous(last known: {})", last_known),
            other => f.write_str(other.name()),
        }
    }
}

impl From<&CommandError> for FailureKind {
    fn from(error: &CommandError) -> Self {
        match error {
            CommandError::NotFound => Self::ContainerNotFound,
            CommandError::AlreadyExists => Self::ContainerAlreadyExists,
            CommandError::NotRunning => Self::ContainerNotRunning,
            CommandError::PermissionDenied => Self::PermissionDenied,
            CommandError::Transient => Self::TransientCommandFailure,
            CommandError::Failed { exit_code } => Self::CommandFailed {
                exit_code: *exit_code,
            },
            CommandError::Unexpected(_) => Self::UnexpectedOutput,
        }
    }
}

/// A failed operation: stable kind plus human-readable context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Tail of the raw command output, kept for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl Diagnostics {
    pub fn from_raw(raw: &RawOutput) -> Self {
        Self {
            exit_code: raw.exit_code,
            stdout_tail: tail(&raw.stdout, defaults::DIAGNOSTIC_TAIL_BYTES),
            stderr_tail: tail(&raw.stderr, defaults::DIAGNOSTIC_TAIL_BYTES),
        }
    }
}

/// Last `max` bytes of `text`, cut on a character boundary.
pub(crate) fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Last non-empty line, for one-line error messages.
pub(crate) fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

/// Outcome of [`ContainerController::apply`](super::ContainerController::apply).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub request_id: Uuid,
    pub host: HostId,
    pub container: ContainerRef,
    pub operation: String,
    pub outcome: Result<OperationOutput, Failure>,
    /// Cached container state after the operation, if any is known
    pub state: Option<ContainerState>,
    pub diagnostics: Option<Diagnostics>,
    /// Dispatch attempts made (connection attempts if none got that far)
    pub attempts: u32,
    pub elapsed: Duration,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn output(&self) -> Option<&OperationOutput> {
        self.outcome.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.outcome.as_ref().err()
    }

    pub fn failure_kind(&self) -> Option<&FailureKind> {
        self.failure().map(|f| &f.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::ParseError;

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        // 'é' is two bytes; a cut in the middle moves forward.
        assert_eq!(tail("xé", 1), "");
        assert_eq!(tail("aéb", 3), "éb");
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("one\ntwo\n\n"), Some("two"));
        assert_eq!(last_line(" \n"), None);
    }

    #[test]
    fn test_failure_kind_from_command_error() {
        assert_eq!(FailureKind::from(&CommandError::NotFound), FailureKind::ContainerNotFound);
        assert_eq!(
            FailureKind::from(&CommandError::Failed { exit_code: 125 }),
            FailureKind::CommandFailed { exit_code: 125 }
        );
        assert_eq!(
            FailureKind::from(&CommandError::Unexpected(ParseError::MissingStatus)),
            FailureKind::UnexpectedOutput
        );
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure::new(
            FailureKind::Ambiguous {
                last_known: ContainerState::Running,
            },
            "deadline passed",
        );
        assert_eq!(
            failure.to_string(),
            "Ambiguous(last known: running): deadline passed"
        );
    }

    #[test]
    fn test_failure_serialization() {
        let json = serde_json::to_value(Failure::new(FailureKind::ContainerNotFound, "gone")).unwrap();
        assert_eq!(json["kind"]["kind"], "container_not_found");
        assert_eq!(json["message"], "gone");
    }
}
