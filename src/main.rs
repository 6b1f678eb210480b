use anyhow::{Context, Result};
use jumphost::cli::{Args, ConfigDiscovery, GlobalOptions, Invocation, OperationCall, Target};
use jumphost::config::ControllerConfig;
use jumphost::controller::{ContainerController, OperationRequest, OperationResult};
use jumphost::translator::{LogLine, LogOptions, OperationKind, OperationOutput, PutOptions};
use jumphost::transport::{LocalTransport, Transport};
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let global = args.global();

    // Initialize logging; results go to stdout, logs to stderr
    let default_filter = if global.verbose {
        "jumphost=debug"
    } else {
        "jumphost=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = match args.mode() {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(invocation, global).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(invocation: Invocation, global: GlobalOptions) -> Result<bool> {
    if let Invocation::ShowConfig = invocation {
        ConfigDiscovery::show_discovery_info();
        return Ok(true);
    }

    let config = load_config(&global)?;

    if global.local {
        info!("Using local {} runtime", config.runtime);
        let controller = ContainerController::with_transport(LocalTransport::new(), &config);
        return execute(&controller, &config, invocation, &global).await;
    }

    run_remote(invocation, &global, &config).await
}

fn load_config(global: &GlobalOptions) -> Result<ControllerConfig> {
    let mut config = match &global.config {
        Some(path) => {
            info!("Loading configuration override from: {:?}", path);
            ControllerConfig::from_toml_file(path)?
        }
        None => ConfigDiscovery::discover_config()?,
    };

    if let Some(runtime) = global.runtime {
        config.runtime = runtime;
    }
    Ok(config)
}

#[cfg(feature = "ssh")]
async fn run_remote(
    invocation: Invocation,
    global: &GlobalOptions,
    config: &ControllerConfig,
) -> Result<bool> {
    use jumphost::transport::{SshOptions, SshTransport};

    let options = SshOptions {
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        ..SshOptions::default()
    };
    let transport = SshTransport::new(options)?;
    let controller = ContainerController::with_transport(transport, config);
    execute(&controller, config, invocation, global).await
}

#[cfg(not(feature = "ssh"))]
async fn run_remote(
    _invocation: Invocation,
    _global: &GlobalOptions,
    _config: &ControllerConfig,
) -> Result<bool> {
    anyhow::bail!("Built without SSH support; pass --local to use a local runtime")
}

async fn execute<T: Transport>(
    controller: &ContainerController<T>,
    config: &ControllerConfig,
    invocation: Invocation,
    global: &GlobalOptions,
) -> Result<bool> {
    let deadline = global
        .timeout_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    let outcome = match invocation {
        Invocation::Apply(OperationCall { target, kind }) => {
            apply(controller, config, target, kind, deadline, global.json).await
        }
        Invocation::Upload {
            target,
            file,
            destination,
        } => {
            let contents = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let kind = OperationKind::Put(PutOptions::new(destination, file_name, contents));
            apply(controller, config, target, kind, deadline, global.json).await
        }
        Invocation::Follow { target, options } => {
            follow(controller, config, target, options, deadline).await
        }
        Invocation::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(true)
        }
    };

    controller.disconnect_all().await;
    outcome
}

async fn apply<T: Transport>(
    controller: &ContainerController<T>,
    config: &ControllerConfig,
    target: Target,
    kind: OperationKind,
    deadline: Option<Instant>,
    json: bool,
) -> Result<bool> {
    let host = config.resolve_host(&target.host)?;
    let mut request = OperationRequest::new(host, target.container, kind);
    request.deadline = deadline;

    let result = controller.apply(request).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    let inner_exit_ok = !matches!(
        result.output(),
        Some(OperationOutput::Exec { exit_code, .. }) if *exit_code != 0
    );
    Ok(result.is_success() && inner_exit_ok)
}

async fn follow<T: Transport>(
    controller: &ContainerController<T>,
    config: &ControllerConfig,
    target: Target,
    options: LogOptions,
    deadline: Option<Instant>,
) -> Result<bool> {
    let host = config.resolve_host(&target.host)?;
    let mut stream = match controller
        .stream_logs(&host, &target.container, options, deadline)
        .await
    {
        Ok(stream) => stream,
        Err(failure) => {
            eprintln!("❌ logs {} on {} failed: {}", target.container, host, failure);
            return Ok(false);
        }
    };

    loop {
        tokio::select! {
            line = stream.next_line() => match line {
                Some(Ok(line)) => print_log_line(&line),
                Some(Err(e)) => {
                    eprintln!("❌ Log stream broke: {}", e);
                    return Ok(false);
                }
                None => return Ok(true),
            },
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted, closing log stream");
                return Ok(true);
            }
        }
    }
}

fn print_result(result: &OperationResult) {
    match &result.outcome {
        Ok(OperationOutput::State { state }) => {
            println!("✅ {} {}: {}", result.operation, result.container, state);
        }
        Ok(OperationOutput::Exec {
            exit_code,
            stdout,
            stderr,
        }) => {
            print!("{}", stdout);
            eprint!("{}", stderr);
            if *exit_code != 0 {
                eprintln!("⚠️  Command exited with status {}", exit_code);
            }
        }
        Ok(OperationOutput::Logs { lines }) => {
            for line in lines {
                print_log_line(line);
            }
        }
        Ok(OperationOutput::Uploaded { bytes }) => {
            println!("✅ Uploaded {} bytes to {}", bytes, result.container);
        }
        Err(failure) => {
            eprintln!(
                "❌ {} {} on {} failed: {}",
                result.operation, result.container, result.host, failure
            );
            if let Some(diagnostics) = &result.diagnostics {
                let stderr = diagnostics.stderr_tail.trim();
                if !stderr.is_empty() {
                    eprintln!("   stderr: {}", stderr);
                }
            }
        }
    }

    debug!(
        "{} took {:?} over {} attempt(s)",
        result.request_id, result.elapsed, result.attempts
    );
}

fn print_log_line(line: &LogLine) {
    match &line.timestamp {
        Some(timestamp) => println!("{} {}", timestamp.to_rfc3339(), line.text),
        None => println!("{}", line.text),
    }
}
