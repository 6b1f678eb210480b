//! Output parsers for the `DockerCliV1` grammar.
//!
//! A command that exits 0 with output we cannot read is reported as
//! [`CommandError::Unexpected`], never coerced into a guessed state. A
//! non-zero exit is matched against the runtime's known error texts; the
//! "already in target state" texts for start and stop are read as success.
//!
//! Exec output is split at [`EXEC_STARTED`]: whatever the runtime printed
//! before the marker is runtime diagnostics, everything after it belongs to
//! the user's command and is never classified.

use crate::retry::FailureClass;
use crate::state::ContainerState;
use crate::transport::RawOutput;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Printed to stderr by the exec wrapper right before the user's command runs.
pub const EXEC_STARTED: &str = "jumphost-exec-started";

static NOT_FOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)no such container").expect("pattern is valid"));
static ALREADY_EXISTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)already in use|already exists").expect("pattern is valid"));
static NOT_RUNNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)is not running|already stopped").expect("pattern is valid")
});
static ALREADY_RUNNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)is already running|already started").expect("pattern is valid")
});
static PERMISSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permission denied").expect("pattern is valid"));
static DAEMON_TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)cannot connect to the docker daemon|connection reset|i/o timeout")
        .expect("pattern is valid")
});

/// Output the command "succeeded" with but we could not read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Empty output where a state report was expected")]
    Empty,

    #[error("Malformed state report: {0}")]
    InvalidJson(String),

    #[error("State report has no status field")]
    MissingStatus,

    #[error("Unrecognized container status '{0}'")]
    UnknownStatus(String),
}

/// Why a command's output did not amount to a successful operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("No such container")]
    NotFound,

    #[error("Container name already in use")]
    AlreadyExists,

    #[error("Container is not running")]
    NotRunning,

    #[error("Permission denied")]
    PermissionDenied,

    /// Runtime hiccup worth another dispatch
    #[error("Container runtime temporarily unavailable")]
    Transient,

    #[error("Command exited with status {exit_code}")]
    Failed { exit_code: i32 },

    #[error("Unexpected output: {0}")]
    Unexpected(#[from] ParseError),
}

impl CommandError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Transient => FailureClass::Transient,
            _ => FailureClass::Permanent,
        }
    }
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

/// Successful, typed result of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationOutput {
    State { state: ContainerState },
    Exec { exit_code: i32, stdout: String, stderr: String },
    Logs { lines: Vec<LogLine> },
    Uploaded { bytes: u64 },
}

impl OperationOutput {
    pub fn state(&self) -> Option<&ContainerState> {
        match self {
            Self::State { state } => Some(state),
            _ => None,
        }
    }
}

/// Parser bound to one operation's expected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputParser {
    /// `start && inspect`
    Start,
    /// `run --detach && inspect`
    Create,
    /// `stop && inspect`
    Stop,
    Inspect,
    Remove,
    Logs { timestamps: bool },
    Exec,
    Put { bytes: u64 },
}

impl OutputParser {
    pub fn parse(&self, raw: &RawOutput) -> Result<OperationOutput, CommandError> {
        if *self == Self::Exec {
            return parse_exec(raw);
        }
        if raw.success() {
            return self.parse_success(raw);
        }

        match self {
            Self::Logs { .. } => {
                // `2>&1` puts runtime errors on stdout.
                let text = format!("{}\n{}", raw.stdout, raw.stderr);
                Err(classify_runtime_error(&text).unwrap_or(CommandError::Failed {
                    exit_code: raw.exit_code,
                }))
            }
            _ => self.parse_failure(raw),
        }
    }

    fn parse_success(&self, raw: &RawOutput) -> Result<OperationOutput, CommandError> {
        let output = match self {
            Self::Start | Self::Create | Self::Stop | Self::Inspect => OperationOutput::State {
                state: parse_state_report(&raw.stdout)?,
            },
            Self::Remove => OperationOutput::State {
                state: ContainerState::Removed,
            },
            Self::Logs { timestamps } => OperationOutput::Logs {
                lines: raw
                    .stdout
                    .lines()
                    .map(|line| parse_log_line(line, *timestamps))
                    .collect(),
            },
            Self::Exec => return parse_exec(raw),
            Self::Put { bytes } => OperationOutput::Uploaded { bytes: *bytes },
        };
        Ok(output)
    }

    fn parse_failure(&self, raw: &RawOutput) -> Result<OperationOutput, CommandError> {
        let text = &raw.stderr;

        match self {
            Self::Stop if NOT_RUNNING_RE.is_match(text) => {
                return Ok(OperationOutput::State {
                    state: ContainerState::Stopped,
                });
            }
            Self::Start if ALREADY_RUNNING_RE.is_match(text) => {
                return Ok(OperationOutput::State {
                    state: ContainerState::Running,
                });
            }
            Self::Remove if NOT_FOUND_RE.is_match(text) => {
                return Ok(OperationOutput::State {
                    state: ContainerState::Removed,
                });
            }
            _ => {}
        }

        Err(classify_runtime_error(text).unwrap_or(CommandError::Failed {
            exit_code: raw.exit_code,
        }))
    }
}

/// Once the marker is present the user's command ran, so its exit code and
/// output are the result. Without it the runtime refused the exec and its
/// stderr is classified like any other runtime failure.
fn parse_exec(raw: &RawOutput) -> Result<OperationOutput, CommandError> {
    match split_exec_stderr(&raw.stderr) {
        Some(command_stderr) => Ok(OperationOutput::Exec {
            exit_code: raw.exit_code,
            stdout: raw.stdout.clone(),
            stderr: command_stderr.to_string(),
        }),
        None if raw.success() => Ok(OperationOutput::Exec {
            exit_code: 0,
            stdout: raw.stdout.clone(),
            stderr: raw.stderr.clone(),
        }),
        None => Err(classify_runtime_error(&raw.stderr).unwrap_or(CommandError::Failed {
            exit_code: raw.exit_code,
        })),
    }
}

/// Stderr of the user's command: everything after the first marker line.
fn split_exec_stderr(stderr: &str) -> Option<&str> {
    let (at, _) = stderr
        .match_indices(EXEC_STARTED)
        .find(|(at, _)| *at == 0 || stderr[..*at].ends_with('\n'))?;
    let rest = &stderr[at + EXEC_STARTED.len()..];
    Some(rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')).unwrap_or(rest))
}

fn classify_runtime_error(text: &str) -> Option<CommandError> {
    if NOT_FOUND_RE.is_match(text) {
        Some(CommandError::NotFound)
    } else if ALREADY_EXISTS_RE.is_match(text) {
        Some(CommandError::AlreadyExists)
    } else if NOT_RUNNING_RE.is_match(text) {
        Some(CommandError::NotRunning)
    } else if PERMISSION_RE.is_match(text) {
        Some(CommandError::PermissionDenied)
    } else if DAEMON_TRANSIENT_RE.is_match(text) {
        Some(CommandError::Transient)
    } else {
        None
    }
}

/// Read a `{{json .State}}` report, taking the last non-empty stdout line.
///
/// Accepts a bare state object, a one-element array of them, or an object
/// with the state nested under `State`; the status key may be `Status` or
/// `status`.
pub(crate) fn parse_state_report(stdout: &str) -> Result<ContainerState, ParseError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .ok_or(ParseError::Empty)?;

    let value: Value =
        serde_json::from_str(line).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let value = match value {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Array(items) => {
            return Err(ParseError::InvalidJson(format!(
                "expected one state object, got {}",
                items.len()
            )));
        }
        other => other,
    };

    let state = match value.get("State") {
        Some(nested) if nested.is_object() => nested,
        _ => &value,
    };
    if !state.is_object() {
        return Err(ParseError::InvalidJson(format!("not an object: {}", line)));
    }

    let status = field(state, "Status")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingStatus)?;
    let error = field(state, "Error")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|e| !e.is_empty());

    match status.to_ascii_lowercase().as_str() {
        "created" => Ok(ContainerState::Creating),
        "running" | "restarting" | "paused" => Ok(ContainerState::Running),
        "exited" | "stopped" => Ok(match error {
            Some(detail) => ContainerState::Error(detail.to_string()),
            None => ContainerState::Stopped,
        }),
        "removing" => Ok(ContainerState::Removed),
        "dead" => Ok(ContainerState::Error(
            error.unwrap_or("dead").to_string(),
        )),
        other => Err(ParseError::UnknownStatus(other.to_string())),
    }
}

/// Look up `Key` or `key`.
fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get(key).or_else(|| value.get(key.to_ascii_lowercase()))
}

/// Split an optional leading RFC 3339 timestamp off a log line.
pub fn parse_log_line(line: &str, timestamps: bool) -> LogLine {
    if timestamps {
        if let Some((stamp, text)) = line.split_once(' ') {
            if let Ok(ts) = DateTime::parse_from_rfc3339(stamp) {
                return LogLine {
                    timestamp: Some(ts.with_timezone(&Utc)),
                    text: text.to_string(),
                };
            }
        }
    }
    LogLine {
        timestamp: None,
        text: line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stdout: &str) -> RawOutput {
        RawOutput::new(0, stdout, "")
    }

    fn failed(stderr: &str) -> RawOutput {
        RawOutput::new(1, "", stderr)
    }

    fn state_of(output: Result<OperationOutput, CommandError>) -> ContainerState {
        output.unwrap().state().cloned().unwrap()
    }

    #[test]
    fn test_state_report_shapes() {
        assert_eq!(parse_state_report(r#"{"status":"running"}"#), Ok(ContainerState::Running));
        assert_eq!(
            parse_state_report(r#"{"Status":"exited","ExitCode":0,"Error":""}"#),
            Ok(ContainerState::Stopped)
        );
        assert_eq!(
            parse_state_report(r#"[{"State":{"Status":"created"}}]"#),
            Ok(ContainerState::Creating)
        );
        assert_eq!(
            parse_state_report("web\n{\"Status\":\"paused\"}\n"),
            Ok(ContainerState::Running)
        );
    }

    #[test]
    fn test_state_report_errors_and_dead() {
        assert_eq!(
            parse_state_report(r#"{"Status":"exited","Error":"OCI runtime create failed"}"#),
            Ok(ContainerState::Error("OCI runtime create failed".into()))
        );
        assert_eq!(
            parse_state_report(r#"{"Status":"dead"}"#),
            Ok(ContainerState::Error("dead".into()))
        );
        assert_eq!(
            parse_state_report(r#"{"Status":"removing"}"#),
            Ok(ContainerState::Removed)
        );
    }

    #[test]
    fn test_unintelligible_state_report() {
        assert_eq!(parse_state_report("  \n"), Err(ParseError::Empty));
        assert!(matches!(parse_state_report("running"), Err(ParseError::InvalidJson(_))));
        assert_eq!(parse_state_report(r#"{"Running":true}"#), Err(ParseError::MissingStatus));
        assert_eq!(
            parse_state_report(r#"{"Status":"hibernating"}"#),
            Err(ParseError::UnknownStatus("hibernating".into()))
        );
        assert!(matches!(parse_state_report("[{},{}]"), Err(ParseError::InvalidJson(_))));
        assert!(matches!(parse_state_report("42"), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn test_lifecycle_parsers_round_trip() {
        let cases = [
            (OutputParser::Start, r#"{"Status":"running"}"#, ContainerState::Running),
            (OutputParser::Create, "3f4e\n{\"Status\":\"running\"}", ContainerState::Running),
            (OutputParser::Stop, "web\n{\"Status\":\"exited\"}", ContainerState::Stopped),
            (OutputParser::Inspect, r#"{"Status":"created"}"#, ContainerState::Creating),
            (OutputParser::Remove, "web\n", ContainerState::Removed),
        ];
        for (parser, stdout, expected) in cases {
            assert_eq!(state_of(parser.parse(&ok(stdout))), expected, "{:?}", parser);
        }
    }

    #[test]
    fn test_already_in_target_state_is_success() {
        assert_eq!(
            state_of(OutputParser::Stop.parse(&failed(
                "Error response from daemon: Container web is not running"
            ))),
            ContainerState::Stopped
        );
        assert_eq!(
            state_of(OutputParser::Start.parse(&failed("Error: container web is already running"))),
            ContainerState::Running
        );
        assert_eq!(
            state_of(OutputParser::Remove.parse(&failed("Error: No such container: web"))),
            ContainerState::Removed
        );
    }

    #[test]
    fn test_domain_errors() {
        assert_eq!(
            OutputParser::Inspect.parse(&failed("Error: No such container: ghost")),
            Err(CommandError::NotFound)
        );
        assert_eq!(
            OutputParser::Create.parse(&failed(
                r#"docker: Error response from daemon: Conflict. The container name "/web" is already in use"#
            )),
            Err(CommandError::AlreadyExists)
        );
        assert_eq!(
            OutputParser::Start.parse(&failed(
                "Got permission denied while trying to connect to the Docker daemon socket"
            )),
            Err(CommandError::PermissionDenied)
        );
        assert_eq!(
            OutputParser::Stop.parse(&RawOutput::new(125, "", "unknown flag: --bogus")),
            Err(CommandError::Failed { exit_code: 125 })
        );
    }

    #[test]
    fn test_daemon_hiccup_is_transient() {
        let err = OutputParser::Inspect
            .parse(&failed(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
            ))
            .unwrap_err();
        assert_eq!(err, CommandError::Transient);
        assert_eq!(err.class(), FailureClass::Transient);
        assert_eq!(CommandError::NotFound.class(), FailureClass::Permanent);
    }

    fn exec_stderr(stderr: &str) -> String {
        format!("{}\n{}", EXEC_STARTED, stderr)
    }

    #[test]
    fn test_exec_exit_code_is_a_result() {
        let out = OutputParser::Exec
            .parse(&RawOutput::new(
                2,
                "",
                exec_stderr("ls: cannot access 'x': No such file or directory"),
            ))
            .unwrap();
        assert_eq!(
            out,
            OperationOutput::Exec {
                exit_code: 2,
                stdout: String::new(),
                stderr: "ls: cannot access 'x': No such file or directory".into(),
            }
        );

        assert_eq!(
            OutputParser::Exec.parse(&failed("Error response from daemon: container abc is not running")),
            Err(CommandError::NotRunning)
        );
        assert_eq!(
            OutputParser::Exec.parse(&failed("Error response from daemon: No such container: web")),
            Err(CommandError::NotFound)
        );
    }

    #[test]
    fn test_exec_command_stderr_is_never_classified() {
        let nested = OutputParser::Exec
            .parse(&RawOutput::new(1, "", exec_stderr("Error: No such container: inner-job\n")))
            .unwrap();
        assert_eq!(
            nested,
            OperationOutput::Exec {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Error: No such container: inner-job\n".into(),
            }
        );

        let reset = OutputParser::Exec
            .parse(&RawOutput::new(
                1,
                "",
                exec_stderr("Error: connection reset by peer while posting payment"),
            ))
            .unwrap();
        assert!(matches!(reset, OperationOutput::Exec { exit_code: 1, .. }));
    }

    #[test]
    fn test_exec_runtime_warnings_before_marker_are_dropped() {
        let raw = RawOutput::new(
            0,
            "ok\n",
            format!("WARN[0000] cgroupv1 is deprecated\n{}\n", EXEC_STARTED),
        );
        assert_eq!(
            OutputParser::Exec.parse(&raw),
            Ok(OperationOutput::Exec {
                exit_code: 0,
                stdout: "ok\n".into(),
                stderr: String::new(),
            })
        );
    }

    #[test]
    fn test_exec_refused_by_unreachable_daemon_is_transient() {
        assert_eq!(
            OutputParser::Exec.parse(&failed(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
            )),
            Err(CommandError::Transient)
        );
        assert_eq!(
            OutputParser::Exec.parse(&RawOutput::new(126, "", "OCI runtime exec failed")),
            Err(CommandError::Failed { exit_code: 126 })
        );
    }

    #[test]
    fn test_logs_snapshot() {
        let out = OutputParser::Logs { timestamps: true }
            .parse(&ok("2024-05-01T10:00:00.123456789Z booting\nplain line\n"))
            .unwrap();
        let OperationOutput::Logs { lines } = out else {
            panic!("expected logs");
        };
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "booting");
        assert!(lines[0].timestamp.is_some());
        assert_eq!(lines[1].timestamp, None);
        assert_eq!(lines[1].text, "plain line");

        assert_eq!(
            OutputParser::Logs { timestamps: false }
                .parse(&RawOutput::new(1, "Error: No such container: ghost\n", "")),
            Err(CommandError::NotFound)
        );
    }

    #[test]
    fn test_put_reports_bytes() {
        assert_eq!(
            OutputParser::Put { bytes: 42 }.parse(&ok("")),
            Ok(OperationOutput::Uploaded { bytes: 42 })
        );
    }
}
