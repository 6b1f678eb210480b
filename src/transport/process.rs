//! Child-process plumbing for transports that shell out (`ssh`, `sh`).

use super::{LineStream, RawOutput, TransportError};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Run `program args...` to completion, feeding `stdin` if given.
///
/// The child is killed if the returned future is dropped, which is how a
/// caller-side timeout or cancellation abandons an in-flight command.
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<RawOutput, TransportError> {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }

    let mut child = cmd.spawn()?;
    let child_stdin = child.stdin.take();

    // Feed stdin while draining stdout/stderr so neither side can block on a
    // full pipe.
    let feed = async move {
        if let (Some(input), Some(mut pipe)) = (stdin, child_stdin) {
            pipe.write_all(input).await?;
            // Dropping the pipe closes it, so the remote side sees EOF.
            pipe.shutdown().await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    // A child that exits without reading its input closes the pipe early;
    // its exit status is what the caller needs to see.
    if let Err(e) = fed
        && e.kind() != std::io::ErrorKind::BrokenPipe
    {
        return Err(e.into());
    }

    Ok(RawOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Spawn `cmd` and forward its stdout line by line.
///
/// When stdout closes, the exit status and collected stderr are passed to
/// `on_exit`; a returned error becomes the final item of the stream.
pub(crate) fn stream_process<F>(mut cmd: Command, on_exit: F) -> Result<LineStream, TransportError>
where
    F: FnOnce(i32, &str) -> Option<TransportError> + Send + 'static,
{
    cmd.kill_on_drop(true);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Io("child stdout was not captured".to_string()))?;
    let mut stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel(LineStream::BUFFER);

    let producer = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(Ok(line)).await.is_err() {
                        debug!("Line stream consumer went away, stopping producer");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(TransportError::from(e))).await;
                    return;
                }
            }
        }

        let mut stderr_text = String::new();
        if let Some(ref mut stderr) = stderr
            && let Err(e) = stderr.read_to_string(&mut stderr_text).await
        {
            warn!("Failed to read stream stderr: {}", e);
        }

        match child.wait().await {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                if let Some(err) = on_exit(code, &stderr_text) {
                    let _ = tx.send(Err(err)).await;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(TransportError::from(e))).await;
            }
        }
    });

    Ok(LineStream::new(rx, Some(producer)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_process_captures_output() {
        let output = run_process("sh", &["-c".into(), "echo out; echo err >&2; exit 3".into()], None)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_run_process_feeds_stdin() {
        let output = run_process("cat", &[], Some(b"piped input")).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "piped input");
    }

    #[tokio::test]
    async fn test_run_process_missing_program() {
        let result = run_process("definitely-not-a-real-binary-jumphost", &[], None).await;
        assert!(matches!(result, Err(TransportError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_stream_process_lines_and_exit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'one\\ntwo\\n'; exit 7"]);
        let mut stream = stream_process(cmd, |code, _| {
            (code != 0).then(|| TransportError::Protocol(format!("exit {code}")))
        })
        .unwrap();

        assert_eq!(stream.next_line().await, Some(Ok("one".to_string())));
        assert_eq!(stream.next_line().await, Some(Ok("two".to_string())));
        assert_eq!(
            stream.next_line().await,
            Some(Err(TransportError::Protocol("exit 7".to_string())))
        );
        assert_eq!(stream.next_line().await, None);
    }
}
