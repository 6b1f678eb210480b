//! Integration tests against a real SSH host.
//!
//! Skipped unless `JUMPHOST_TEST_SSH_HOST` names a reachable host
//! (`user@host` or `ssh://user@host:port`) with key-based login. The
//! container tests additionally need docker on that host.

#![cfg(feature = "ssh")]

use jumphost::controller::{ContainerController, FailureKind, OperationRequest};
use jumphost::env;
use jumphost::host::{ContainerRef, Host};
use jumphost::state::ContainerState;
use jumphost::translator::{ExecOptions, OperationKind, OperationOutput, RunOptions};
use jumphost::transport::{SshOptions, SshTransport, Transport};
use jumphost::ControllerConfig;
use serial_test::serial;
use test_tag::tag;

fn test_host() -> Option<Host> {
    let spec = std::env::var(env::vars::TEST_SSH_HOST).ok()?;
    match Host::parse(&spec) {
        Ok(host) => Some(host),
        Err(e) => {
            eprintln!("Ignoring {}: {}", env::vars::TEST_SSH_HOST, e);
            None
        }
    }
}

fn controller() -> ContainerController<SshTransport> {
    let transport = SshTransport::new(SshOptions::default()).expect("ssh client installed");
    ContainerController::with_transport(transport, &ControllerConfig::default())
}

#[tokio::test]
#[serial]
#[tag(integration, ssh)]
async fn test_connect_run_and_health_check() {
    let Some(host) = test_host() else {
        eprintln!("Skipping SSH tests ({} not set)", env::vars::TEST_SSH_HOST);
        return;
    };

    let transport = SshTransport::new(SshOptions::default()).expect("ssh client installed");
    let session = transport.connect(&host).await.expect("connect");

    let output = transport
        .run(&session, &jumphost::transport::RemoteCommand::new("echo hello; exit 3"))
        .await
        .expect("run");
    assert_eq!(output.exit_code, 3);
    assert_eq!(output.stdout.trim(), "hello");

    transport.health_check(&session).await.expect("health check");
    transport.disconnect(session).await;
}

#[tokio::test]
#[serial]
#[tag(integration, ssh)]
async fn test_container_lifecycle() {
    let Some(host) = test_host() else {
        eprintln!("Skipping SSH tests ({} not set)", env::vars::TEST_SSH_HOST);
        return;
    };
    let controller = controller();
    let container = ContainerRef::new("jumphost-it").unwrap();
    let op = |kind| OperationRequest::new(host.clone(), container.clone(), kind);

    // Leftovers from an aborted run
    controller.apply(op(OperationKind::Remove)).await;

    let created = controller
        .apply(op(OperationKind::Start(Some(RunOptions::new("alpine")))))
        .await;
    assert_eq!(created.state, Some(ContainerState::Running), "{:?}", created.outcome);

    let exec = controller
        .apply(op(OperationKind::Exec(ExecOptions::new("echo inside"))))
        .await;
    match exec.output() {
        Some(OperationOutput::Exec { exit_code, stdout, .. }) => {
            assert_eq!(*exit_code, 0);
            assert_eq!(stdout.trim(), "inside");
        }
        other => panic!("Unexpected exec output: {:?}", other),
    }

    let stopped = controller.apply(op(OperationKind::Stop)).await;
    assert_eq!(stopped.state, Some(ContainerState::Stopped), "{:?}", stopped.outcome);

    let removed = controller.apply(op(OperationKind::Remove)).await;
    assert!(removed.is_success());

    let gone = controller.apply(op(OperationKind::Inspect)).await;
    assert_eq!(gone.failure_kind(), Some(&FailureKind::ContainerNotFound));

    controller.disconnect_all().await;
}
