//! Command line argument parsing
//!
//! One subcommand per container operation, each taking `<HOST> <CONTAINER>`:
//! - `start`, `stop`, `inspect`, `remove`: lifecycle
//! - `run`: create and start from an image
//! - `logs`: bounded snapshot, or `--follow` to stream
//! - `exec`: run a shell command inside the container
//! - `put`: upload a local file into the container
//! - `show-config`: show configuration discovery information
//!
//! `<HOST>` is either a host name from the configuration file or an
//! address such as `deploy@build-01` or `ssh://deploy@build-01:2222`.

use crate::host::ContainerRef;
use crate::translator::{ExecOptions, LogOptions, OperationKind, RunOptions, RuntimeFlavor};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// What the binary was asked to do.
#[derive(Debug)]
pub enum Invocation {
    /// Apply one operation and print its result
    Apply(OperationCall),
    /// Upload a local file; the file is read by the caller
    Upload {
        target: Target,
        file: PathBuf,
        destination: String,
    },
    /// Follow logs until the container stops or the user interrupts
    Follow { target: Target, options: LogOptions },
    /// Show configuration discovery info
    ShowConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Host name or address, resolved against the configuration
    pub host: String,
    pub container: ContainerRef,
}

#[derive(Debug)]
pub struct OperationCall {
    pub target: Target,
    pub kind: OperationKind,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub local: bool,
    pub runtime: Option<RuntimeFlavor>,
    pub timeout_secs: Option<u64>,
    pub verbose: bool,
    pub json: bool,
}

#[derive(Debug, Parser)]
#[command(name = "jumphost")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Control containers on remote hosts over SSH")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Run the container runtime on this machine instead of over SSH
    #[arg(long = "local", global = true)]
    pub local: bool,
    /// Container runtime on the host (docker or podman)
    #[arg(long = "runtime", global = true)]
    pub runtime: Option<RuntimeFlavor>,
    /// Overall deadline for the operation, in seconds
    #[arg(long = "timeout", value_name = "SECS", global = true)]
    pub timeout_secs: Option<u64>,
    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    /// Print the result as JSON
    #[arg(long = "json", global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start an existing container
    Start { host: String, container: String },
    /// Create and start a container from an image
    Run {
        host: String,
        container: String,
        /// Image to run
        #[arg(long = "image", default_value = crate::env::defaults::CONTAINER_IMAGE)]
        image: String,
        /// Run with extended privileges
        #[arg(long = "privileged")]
        privileged: bool,
        /// User inside the container (default root)
        #[arg(short = 'u', long = "user")]
        user: Option<String>,
        /// Environment variable (can be used multiple times)
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Command to run instead of keeping the container idle
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Stop a running container
    Stop { host: String, container: String },
    /// Report a container's state
    Inspect { host: String, container: String },
    /// Show a container's logs
    Logs {
        host: String,
        container: String,
        /// Only the last N lines
        #[arg(short = 'n', long = "tail")]
        tail: Option<usize>,
        /// Prefix lines with timestamps
        #[arg(short = 't', long = "timestamps")]
        timestamps: bool,
        /// Keep streaming new lines
        #[arg(short = 'f', long = "follow")]
        follow: bool,
    },
    /// Remove a container, stopping it first if needed
    Remove { host: String, container: String },
    /// Run a shell command inside a running container
    Exec {
        host: String,
        container: String,
        /// Shell command, run through `sh -c`
        command: String,
        /// User inside the container
        #[arg(short = 'u', long = "user")]
        user: Option<String>,
    },
    /// Upload a local file into a container
    Put {
        host: String,
        container: String,
        /// Local file
        file: PathBuf,
        /// Destination path; a trailing `/` keeps the local file name
        destination: String,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn global(&self) -> GlobalOptions {
        GlobalOptions {
            config: self.config.clone(),
            local: self.local,
            runtime: self.runtime,
            timeout_secs: self.timeout_secs,
            verbose: self.verbose,
            json: self.json,
        }
    }

    pub fn mode(&self) -> Result<Invocation, String> {
        let command = self.command.as_ref().ok_or_else(|| {
            "No command specified. Use 'jumphost --help' to see available commands.".to_string()
        })?;

        let invocation = match command {
            Commands::Start { host, container } => {
                Self::apply(host, container, OperationKind::Start(None))?
            }
            Commands::Run {
                host,
                container,
                image,
                privileged,
                user,
                env,
                command,
            } => {
                let mut options = RunOptions::new(image.clone()).privileged(*privileged);
                if !command.is_empty() {
                    options = options.with_command(command.iter().cloned());
                }
                if user.is_some() {
                    options = options.with_user(user.clone());
                }
                for pair in env {
                    let (key, value) = Self::parse_env_pair(pair)?;
                    options = options.with_env(key, value);
                }
                Self::apply(host, container, OperationKind::Start(Some(options)))?
            }
            Commands::Stop { host, container } => {
                Self::apply(host, container, OperationKind::Stop)?
            }
            Commands::Inspect { host, container } => {
                Self::apply(host, container, OperationKind::Inspect)?
            }
            Commands::Logs {
                host,
                container,
                tail,
                timestamps,
                follow,
            } => {
                let mut options = LogOptions {
                    timestamps: *timestamps,
                    ..LogOptions::default()
                };
                if tail.is_some() || *follow {
                    // A followed stream starts from the end unless asked otherwise.
                    options.tail = Some(tail.unwrap_or(0));
                }
                if *follow {
                    Invocation::Follow {
                        target: Self::target(host, container)?,
                        options,
                    }
                } else {
                    Self::apply(host, container, OperationKind::Logs(options))?
                }
            }
            Commands::Remove { host, container } => {
                Self::apply(host, container, OperationKind::Remove)?
            }
            Commands::Exec {
                host,
                container,
                command,
                user,
            } => {
                let mut options = ExecOptions::new(command.clone());
                if let Some(user) = user {
                    options = options.with_user(user.clone());
                }
                Self::apply(host, container, OperationKind::Exec(options))?
            }
            Commands::Put {
                host,
                container,
                file,
                destination,
            } => Invocation::Upload {
                target: Self::target(host, container)?,
                file: file.clone(),
                destination: destination.clone(),
            },
            Commands::ShowConfig => Invocation::ShowConfig,
        };
        Ok(invocation)
    }

    fn target(host: &str, container: &str) -> Result<Target, String> {
        let container = ContainerRef::new(container).map_err(|e| e.to_string())?;
        Ok(Target {
            host: host.to_string(),
            container,
        })
    }

    fn apply(host: &str, container: &str, kind: OperationKind) -> Result<Invocation, String> {
        Ok(Invocation::Apply(OperationCall {
            target: Self::target(host, container)?,
            kind,
        }))
    }

    fn parse_env_pair(pair: &str) -> Result<(&str, &str), String> {
        match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key, value)),
            _ => Err(format!("Invalid environment variable '{}', expected KEY=VALUE", pair)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_lifecycle_commands() {
        let args = parse(&["jumphost", "stop", "build-01", "web"]);
        match args.mode().unwrap() {
            Invocation::Apply(call) => {
                assert_eq!(call.target.host, "build-01");
                assert_eq!(call.target.container.as_str(), "web");
                assert_eq!(call.kind, OperationKind::Stop);
            }
            other => panic!("Expected Apply, got {:?}", other),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let args = parse(&[
            "jumphost", "run", "build-01", "ci", "--image", "alpine", "--privileged", "-e",
            "MODE=fast", "--", "sleep", "60",
        ]);
        let Invocation::Apply(call) = args.mode().unwrap() else {
            panic!("Expected Apply");
        };
        let OperationKind::Start(Some(options)) = call.kind else {
            panic!("Expected run options");
        };
        assert_eq!(options.image, "alpine");
        assert!(options.privileged);
        assert_eq!(options.command, vec!["sleep", "60"]);
        assert_eq!(options.env.get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(options.user.as_deref(), Some("root"));
    }

    #[test]
    fn test_invalid_env_pair() {
        let args = parse(&["jumphost", "run", "h", "c", "-e", "=oops"]);
        assert!(args.mode().unwrap_err().contains("KEY=VALUE"));
    }

    #[test]
    fn test_logs_follow_and_snapshot() {
        let args = parse(&["jumphost", "logs", "h", "web", "-f", "-t"]);
        match args.mode().unwrap() {
            Invocation::Follow { options, .. } => {
                assert_eq!(options.tail, Some(0));
                assert!(options.timestamps);
            }
            other => panic!("Expected Follow, got {:?}", other),
        }

        let args = parse(&["jumphost", "logs", "h", "web", "--tail", "5"]);
        let Invocation::Apply(call) = args.mode().unwrap() else {
            panic!("Expected Apply");
        };
        assert_eq!(
            call.kind,
            OperationKind::Logs(LogOptions {
                tail: Some(5),
                timestamps: false
            })
        );
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&[
            "jumphost", "inspect", "h", "web", "--local", "--runtime", "podman", "--timeout", "5",
            "-v",
        ]);
        let global = args.global();
        assert!(global.local);
        assert!(global.verbose);
        assert_eq!(global.runtime, Some(RuntimeFlavor::Podman));
        assert_eq!(global.timeout_secs, Some(5));
    }

    #[test]
    fn test_invalid_container_name() {
        let args = parse(&["jumphost", "inspect", "h", "bad name!"]);
        assert!(args.mode().is_err());
    }

    #[test]
    fn test_no_command() {
        let args = Args {
            config: None,
            local: false,
            runtime: None,
            timeout_secs: None,
            verbose: false,
            json: false,
            command: None,
        };
        assert!(args.mode().is_err());
    }
}
