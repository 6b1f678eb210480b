//! # Operation Translator
//!
//! Maps an abstract container operation onto the remote runtime's command
//! surface and pairs it with the parser for that command's output.
//!
//! ## Operations
//!
//! | Kind      | Command (DockerCliV1)                                         | Parsed into            |
//! |-----------|---------------------------------------------------------------|------------------------|
//! | `Start`   | `docker start <ref>` or `docker run --detach --name <ref> ...` | [`ContainerState`]     |
//! | `Stop`    | `docker stop <ref>`                                           | [`ContainerState`]     |
//! | `Inspect` | `docker inspect --type container --format '{{json .State}}'`  | [`ContainerState`]     |
//! | `Logs`    | `docker logs --tail N <ref>`                                  | [`LogLine`]s           |
//! | `Remove`  | `docker rm --force <ref>`                                     | [`ContainerState`]     |
//! | `Exec`    | `docker exec <ref> sh -c <wrapper> sh <cmd>`                  | exit code and output   |
//! | `Put`     | `docker exec --interactive <ref> tar x -C <dir> -f -`         | uploaded byte count    |
//!
//! Lifecycle commands are chained with an inspect (`&& docker inspect ...`)
//! so a single dispatch both performs the change and reports the resulting
//! state.
//!
//! Exec runs the user's command through a small wrapper that first prints
//! [`EXEC_STARTED`] to stderr, so the parser can tell runtime errors from the
//! command's own output.
//!
//! ## Escaping
//!
//! Every caller supplied value is shell-escaped here. Downstream layers hand
//! the command line to the remote shell untouched.
//!
//! ## Grammar versioning
//!
//! Output grammars are bound to a [`GrammarVersion`]. Podman's CLI is
//! compatible with the docker grammar for everything used here, so both
//! runtimes share `DockerCliV1`.

use crate::env::defaults;
use crate::host::ContainerRef;
use crate::state::ContainerState;
use crate::transport::RemoteCommand;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

mod archive;
mod parse;

pub use parse::{
    CommandError, EXEC_STARTED, LogLine, OperationOutput, OutputParser, ParseError,
    parse_log_line,
};

/// Container runtime CLI on the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFlavor {
    #[default]
    Docker,
    Podman,
}

impl RuntimeFlavor {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    pub fn grammar(&self) -> GrammarVersion {
        GrammarVersion::DockerCliV1
    }
}

impl fmt::Display for RuntimeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl std::str::FromStr for RuntimeFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            other => Err(format!("Unknown container runtime '{}'", other)),
        }
    }
}

/// Version of the command/output grammar the parsers are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrammarVersion {
    /// `docker`/`podman` CLI with `inspect --format '{{json .State}}'`
    DockerCliV1,
}

/// Settings for creating a container when starting one that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub image: String,
    /// Main process; keeps the container alive by default
    #[serde(default = "default_run_command")]
    pub command: Vec<String>,
    /// Needed for docker-in-docker images
    #[serde(default)]
    pub privileged: bool,
    #[serde(default = "default_run_user")]
    pub user: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_run_command() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

fn default_run_user() -> Option<String> {
    Some("root".to_string())
}

impl RunOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: default_run_command(),
            privileged: false,
            user: default_run_user(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(defaults::CONTAINER_IMAGE)
    }
}

/// Options for a bounded log snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Only the last N lines (`None` = all)
    pub tail: Option<usize>,
    /// Ask the runtime to prefix lines with RFC 3339 timestamps
    #[serde(default)]
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail: Some(defaults::LOG_TAIL_LINES),
            timestamps: false,
        }
    }
}

/// A command to run inside a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Shell command, run through `sh -c`
    pub command: String,
    pub user: Option<String>,
    /// Bytes fed to the command's stdin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Vec<u8>>,
}

impl ExecOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            user: None,
            stdin: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

/// A file to place inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    /// Destination path; a trailing `/` means "directory, keep the file name"
    pub destination: String,
    /// Name used when the destination does not name a file
    pub file_name: String,
    pub contents: Vec<u8>,
}

impl PutOptions {
    pub fn new(
        destination: impl Into<String>,
        file_name: impl Into<String>,
        contents: Vec<u8>,
    ) -> Self {
        Self {
            destination: destination.into(),
            file_name: file_name.into(),
            contents,
        }
    }

    /// Split the destination into (directory, file name).
    pub fn resolve(&self) -> Result<(String, String), TranslateError> {
        let (dir, name) = match self.destination.rsplit_once('/') {
            Some(("", name)) => ("/", name),
            Some((dir, name)) => (dir, name),
            None => ("", self.destination.as_str()),
        };
        let dir = if dir.is_empty() { "." } else { dir };
        let name = if name.is_empty() {
            self.file_name.as_str()
        } else {
            name
        };

        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(TranslateError::InvalidDestination(self.destination.clone()));
        }
        Ok((dir.to_string(), name.to_string()))
    }
}

/// Closed set of operations the controller can apply to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case")]
pub enum OperationKind {
    /// Start an existing container, or create and start one with `RunOptions`
    Start(Option<RunOptions>),
    Stop,
    Inspect,
    /// Bounded log snapshot; use the controller's stream for `--follow`
    Logs(LogOptions),
    /// Stop and delete the container
    Remove,
    Exec(ExecOptions),
    Put(PutOptions),
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(None) => "start",
            Self::Start(Some(_)) => "run",
            Self::Stop => "stop",
            Self::Inspect => "inspect",
            Self::Logs(_) => "logs",
            Self::Remove => "remove",
            Self::Exec(_) => "exec",
            Self::Put(_) => "put",
        }
    }

    /// Whether the operation changes anything on the remote host.
    ///
    /// A mutating operation interrupted after dispatch has an ambiguous
    /// outcome; a read-only one can simply be asked again.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Inspect | Self::Logs(_))
    }

    /// Whether a successful result reports the container's lifecycle state.
    pub fn reports_state(&self) -> bool {
        matches!(
            self,
            Self::Start(_) | Self::Stop | Self::Inspect | Self::Remove
        )
    }

    /// Whether success means a container was created under this name.
    pub fn creates(&self) -> bool {
        matches!(self, Self::Start(Some(_)))
    }

    /// Whether the command may be sent again after a dispatch whose answer
    /// was lost.
    ///
    /// Lifecycle commands read "already in target state" as success, a
    /// repeated `run` is recovered by re-inspecting, and a put extracts the
    /// same archive again. An exec'd command could run twice.
    pub fn is_retry_safe(&self) -> bool {
        !matches!(self, Self::Exec(_))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requests the translator cannot turn into a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("Invalid upload destination '{0}'")]
    InvalidDestination(String),

    #[error("Failed to build upload archive: {0}")]
    Archive(String),

    #[error("Empty command")]
    EmptyCommand,
}

/// A ready-to-dispatch command and how to read its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: RemoteCommand,
    pub parser: OutputParser,
}

/// Builds runtime commands for one runtime flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Translator {
    runtime: RuntimeFlavor,
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}

impl Translator {
    pub fn new(runtime: RuntimeFlavor) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> RuntimeFlavor {
        self.runtime
    }

    pub fn grammar(&self) -> GrammarVersion {
        self.runtime.grammar()
    }

    fn program(&self) -> &'static str {
        self.runtime.program()
    }

    fn inspect_line(&self, container: &ContainerRef) -> String {
        format!(
            "{} inspect --type container --format '{{{{json .State}}}}' {}",
            self.program(),
            quote(container.as_str())
        )
    }

    /// Inspect command for `container`.
    pub fn inspect(&self, container: &ContainerRef) -> CommandSpec {
        CommandSpec {
            command: RemoteCommand::new(self.inspect_line(container)),
            parser: OutputParser::Inspect,
        }
    }

    fn then_inspect(&self, line: String, container: &ContainerRef) -> String {
        format!("{} && {}", line, self.inspect_line(container))
    }

    /// Build the command and parser for `kind` applied to `container`.
    pub fn translate(
        &self,
        container: &ContainerRef,
        kind: &OperationKind,
    ) -> Result<CommandSpec, TranslateError> {
        let rt = self.program();
        let name = quote(container.as_str());

        let spec = match kind {
            OperationKind::Start(None) => CommandSpec {
                command: RemoteCommand::new(
                    self.then_inspect(format!("{} start {}", rt, name), container),
                ),
                parser: OutputParser::Start,
            },
            OperationKind::Start(Some(run)) => {
                if run.image.trim().is_empty() {
                    return Err(TranslateError::EmptyCommand);
                }
                let mut parts = vec![format!("{} run", rt)];
                if let Some(user) = &run.user {
                    parts.push(format!("--user {}", quote(user)));
                }
                parts.push(format!("--name {}", name));
                parts.push("--detach".to_string());
                if run.privileged {
                    parts.push("--privileged".to_string());
                }
                for (key, value) in &run.env {
                    parts.push(format!("--env {}", quote(&format!("{}={}", key, value))));
                }
                parts.push(quote(&run.image).into_owned());
                parts.extend(run.command.iter().map(|arg| quote(arg).into_owned()));

                CommandSpec {
                    command: RemoteCommand::new(self.then_inspect(parts.join(" "), container)),
                    parser: OutputParser::Create,
                }
            }
            OperationKind::Stop => CommandSpec {
                command: RemoteCommand::new(
                    self.then_inspect(format!("{} stop {}", rt, name), container),
                ),
                parser: OutputParser::Stop,
            },
            OperationKind::Inspect => self.inspect(container),
            OperationKind::Logs(options) => {
                CommandSpec {
                    command: RemoteCommand::new(self.logs_line(container, options, false)),
                    parser: OutputParser::Logs {
                        timestamps: options.timestamps,
                    },
                }
            }
            OperationKind::Remove => CommandSpec {
                command: RemoteCommand::new(format!("{} rm --force {}", rt, name)),
                parser: OutputParser::Remove,
            },
            OperationKind::Exec(exec) => {
                if exec.command.trim().is_empty() {
                    return Err(TranslateError::EmptyCommand);
                }
                let mut parts = vec![format!("{} exec", rt)];
                if let Some(user) = &exec.user {
                    parts.push(format!("--user {}", quote(user)));
                }
                if exec.stdin.is_some() {
                    parts.push("--interactive".to_string());
                }
                parts.push(name.into_owned());
                // `$1` is parsed only after the marker is out.
                let wrapper = format!("echo {} >&2; exec sh -c \"$1\"", EXEC_STARTED);
                parts.push(format!("sh -c {} sh {}", quote(&wrapper), quote(&exec.command)));

                let mut command = RemoteCommand::new(parts.join(" "));
                if let Some(stdin) = &exec.stdin {
                    command = command.with_stdin(stdin.clone());
                }
                CommandSpec {
                    command,
                    parser: OutputParser::Exec,
                }
            }
            OperationKind::Put(put) => {
                let (dir, file_name) = put.resolve()?;
                let archive = archive::pack_file(&file_name, &put.contents)
                    .map_err(|e| TranslateError::Archive(e.to_string()))?;
                CommandSpec {
                    command: RemoteCommand::new(format!(
                        "{} exec --interactive {} tar x -C {} -f -",
                        rt,
                        name,
                        quote(&dir)
                    ))
                    .with_stdin(archive),
                    parser: OutputParser::Put {
                        bytes: put.contents.len() as u64,
                    },
                }
            }
        };
        Ok(spec)
    }

    /// Command line for `logs`; `follow` keeps it running until the
    /// container stops or the stream is dropped.
    pub fn logs_line(&self, container: &ContainerRef, options: &LogOptions, follow: bool) -> String {
        let mut parts = vec![format!("{} logs", self.program())];
        if follow {
            parts.push("--follow".to_string());
        }
        if let Some(tail) = options.tail {
            parts.push(format!("--tail {}", tail));
        }
        if options.timestamps {
            parts.push("--timestamps".to_string());
        }
        parts.push(quote(container.as_str()).into_owned());
        // Container stderr is part of its log.
        parts.push("2>&1".to_string());
        parts.join(" ")
    }

    /// Parse one state report with this translator's grammar.
    pub fn parse_state(&self, stdout: &str) -> Result<ContainerState, ParseError> {
        parse::parse_state_report(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn web() -> ContainerRef {
        ContainerRef::new("web").unwrap()
    }

    #[test]
    fn test_start_chains_inspect() {
        let spec = Translator::default()
            .translate(&web(), &OperationKind::Start(None))
            .unwrap();
        assert_eq!(
            spec.command.line,
            "docker start web && docker inspect --type container --format '{{json .State}}' web"
        );
        assert_eq!(spec.parser, OutputParser::Start);
        assert!(spec.command.stdin.is_none());
    }

    #[test]
    fn test_run_builds_detached_container() {
        let run = RunOptions::new("alpine")
            .privileged(true)
            .with_env("MODE", "ci run");
        let spec = Translator::new(RuntimeFlavor::Podman)
            .translate(&web(), &OperationKind::Start(Some(run)))
            .unwrap();
        assert_eq!(
            spec.command.line,
            "podman run --user root --name web --detach --privileged --env 'MODE=ci run' \
             alpine sleep infinity && podman inspect --type container --format \
             '{{json .State}}' web"
        );
        assert_eq!(spec.parser, OutputParser::Create);
    }

    #[test]
    fn test_stop_inspect_remove_lines() {
        let t = Translator::default();
        assert!(t
            .translate(&web(), &OperationKind::Stop)
            .unwrap()
            .command
            .line
            .starts_with("docker stop web && docker inspect"));
        assert_eq!(
            t.translate(&web(), &OperationKind::Inspect).unwrap().command.line,
            "docker inspect --type container --format '{{json .State}}' web"
        );
        assert_eq!(
            t.translate(&web(), &OperationKind::Remove).unwrap().command.line,
            "docker rm --force web"
        );
    }

    #[test]
    fn test_logs_line() {
        let t = Translator::default();
        let options = LogOptions {
            tail: Some(50),
            timestamps: true,
        };
        assert_eq!(
            t.logs_line(&web(), &options, false),
            "docker logs --tail 50 --timestamps web 2>&1"
        );
        assert_eq!(
            t.logs_line(&web(), &LogOptions { tail: None, timestamps: false }, true),
            "docker logs --follow web 2>&1"
        );
    }

    #[test]
    fn test_exec_escapes_command() {
        let exec = ExecOptions::new("echo \"$HOME\"; ls 'a b'").with_user("app");
        let spec = Translator::default()
            .translate(&web(), &OperationKind::Exec(exec))
            .unwrap();
        assert_eq!(
            spec.command.line,
            r#"docker exec --user app web sh -c 'echo jumphost-exec-started >&2; exec sh -c "$1"' sh 'echo "$HOME"; ls '\''a b'\'''"#
        );
        assert_eq!(spec.parser, OutputParser::Exec);
    }

    #[test]
    fn test_exec_with_stdin_is_interactive() {
        let exec = ExecOptions::new("cat > /tmp/x").with_stdin(b"data".to_vec());
        let spec = Translator::default()
            .translate(&web(), &OperationKind::Exec(exec))
            .unwrap();
        assert!(spec.command.line.starts_with("docker exec --interactive web sh -c"));
        assert_eq!(spec.command.stdin.as_deref(), Some(&b"data"[..]));
    }

    #[test]
    fn test_empty_exec_rejected() {
        let result = Translator::default().translate(&web(), &OperationKind::Exec(ExecOptions::new("  ")));
        assert_eq!(result, Err(TranslateError::EmptyCommand));
    }

    #[test]
    fn test_put_streams_archive() {
        let put = PutOptions::new("/etc/app/", "settings.toml", b"key = 1\n".to_vec());
        let spec = Translator::default()
            .translate(&web(), &OperationKind::Put(put))
            .unwrap();
        assert_eq!(spec.command.line, "docker exec --interactive web tar x -C /etc/app -f -");
        assert_eq!(spec.parser, OutputParser::Put { bytes: 8 });

        let archive = spec.command.stdin.unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let entry = reader.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("settings.toml"));
        assert_eq!(entry.header().size().unwrap(), 8);
    }

    #[test]
    fn test_put_destination_resolution() {
        let resolve = |dest: &str| PutOptions::new(dest, "local.txt", Vec::new()).resolve();
        assert_eq!(resolve("/srv/data/out.txt"), Ok(("/srv/data".into(), "out.txt".into())));
        assert_eq!(resolve("/srv/data/"), Ok(("/srv/data".into(), "local.txt".into())));
        assert_eq!(resolve("out.txt"), Ok((".".into(), "out.txt".into())));
        assert_eq!(resolve(""), Ok((".".into(), "local.txt".into())));
        assert_eq!(resolve("/top.txt"), Ok(("/".into(), "top.txt".into())));
        assert!(PutOptions::new("/srv/", "", Vec::new()).resolve().is_err());
        assert!(resolve("/srv/..").is_err());
    }

    #[test]
    fn test_operation_kind_properties() {
        assert!(OperationKind::Stop.is_mutating());
        assert!(!OperationKind::Inspect.is_mutating());
        assert!(!OperationKind::Logs(LogOptions::default()).is_mutating());
        assert!(OperationKind::Start(Some(RunOptions::default())).creates());
        assert!(!OperationKind::Start(None).creates());
        assert_eq!(OperationKind::Start(Some(RunOptions::default())).name(), "run");
        assert!(!OperationKind::Exec(ExecOptions::new("ls")).reports_state());
        assert!(!OperationKind::Exec(ExecOptions::new("ls")).is_retry_safe());
        assert!(OperationKind::Start(Some(RunOptions::default())).is_retry_safe());
        assert!(OperationKind::Put(PutOptions::new("/x", "x", Vec::new())).is_retry_safe());
    }

    #[test]
    fn test_runtime_flavor_from_str() {
        assert_eq!("Podman".parse::<RuntimeFlavor>(), Ok(RuntimeFlavor::Podman));
        assert!("containerd".parse::<RuntimeFlavor>().is_err());
        let parsed: RuntimeFlavor = serde_json::from_str("\"docker\"").unwrap();
        assert_eq!(parsed, RuntimeFlavor::Docker);
    }
}
