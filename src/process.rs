//! Child process helpers shared by the build toolchain and the ssh transport.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{StageError, StageKind};
use crate::job::Job;

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }
}

/// Why [`capture`] produced no output.
#[derive(Debug)]
pub enum CaptureError {
    Spawn(std::io::Error),
    TimedOut,
}

/// Run `command` to completion under `timeout` and capture its output,
/// whatever the exit status. The child is killed when the deadline passes.
pub async fn capture(
    mut command: Command,
    timeout: Duration,
) -> Result<ProcessOutput, CaptureError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Ok(Err(e)) => Err(CaptureError::Spawn(e)),
        Err(_) => Err(CaptureError::TimedOut),
    }
}

/// Like [`capture`], but a non-zero exit, a spawn failure and the deadline
/// all become a [`StageError`] of `kind`.
pub async fn run(
    command: Command,
    kind: StageKind,
    timeout: Duration,
) -> Result<ProcessOutput, StageError> {
    match capture(command, timeout).await {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(
            StageError::new(kind, format!("exit code {:?}", output.exit_code))
                .with_output(output.combined()),
        ),
        Err(CaptureError::Spawn(e)) => Err(StageError::new(kind, format!("failed to spawn: {e}"))),
        Err(CaptureError::TimedOut) => Err(StageError::timed_out(kind, timeout)),
    }
}

/// Run `command` under `timeout`, forwarding stdout and stderr to the job's
/// client as they arrive. Returns everything that was printed.
pub async fn run_streaming(
    mut command: Command,
    kind: StageKind,
    timeout: Duration,
    job: &mut Job,
) -> Result<Vec<u8>, StageError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| StageError::new(kind, format!("failed to spawn: {e}")))?;
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let mut captured = Vec::new();
    let streamed = tokio::time::timeout(timeout, async {
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];
        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                read = read_some(&mut stdout, &mut out_buf) => {
                    match read {
                        Some(n) => {
                            captured.extend_from_slice(&out_buf[..n]);
                            job.forward(&out_buf[..n]).await;
                        }
                        None => stdout = None,
                    }
                }
                read = read_some(&mut stderr, &mut err_buf) => {
                    match read {
                        Some(n) => {
                            captured.extend_from_slice(&err_buf[..n]);
                            job.forward(&err_buf[..n]).await;
                        }
                        None => stderr = None,
                    }
                }
            }
        }
        child.wait().await
    })
    .await;

    match streamed {
        Ok(Ok(status)) if status.success() => Ok(captured),
        Ok(Ok(status)) => Err(StageError::new(kind, format!("exit code {:?}", status.code()))),
        Ok(Err(e)) => Err(StageError::new(kind, format!("failed to wait: {e}"))),
        Err(_) => Err(StageError::timed_out(kind, timeout)),
    }
}

/// Read from an optional pipe; `None` at EOF or when the pipe is gone.
async fn read_some<R>(pipe: &mut Option<R>, buf: &mut [u8]) -> Option<usize>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match pipe {
        Some(reader) => match reader.read(buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(n),
        },
        None => std::future::pending().await,
    }
}

/// `sh -c <script>`
pub fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Connection;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn run_captures_output() {
        let output = run(shell("echo hello"), StageKind::Build, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"hello\n".to_vec());
        assert!(output.success());
    }

    #[tokio::test]
    async fn run_reports_failure_with_output() {
        let err = run(
            shell("echo 'error message' >&2 && exit 3"),
            StageKind::Secrets,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, StageKind::Secrets);
        assert!(String::from_utf8_lossy(&err.output).contains("error message"));
        assert!(err.detail.contains("3"));
    }

    #[tokio::test]
    async fn run_enforces_timeout() {
        let err = run(shell("sleep 5"), StageKind::Build, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.kind, StageKind::Build);
    }

    #[tokio::test]
    async fn run_streaming_forwards_to_client() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut job = Job::new(Connection::new("test", server));

        let captured = run_streaming(
            shell("echo one; echo two >&2"),
            StageKind::PostUpload,
            Duration::from_secs(5),
            &mut job,
        )
        .await
        .unwrap();
        drop(job);

        let text = String::from_utf8_lossy(&captured).to_string();
        assert!(text.contains("one"));
        assert!(text.contains("two"));

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert!(received.contains("one"));
        assert!(received.contains("two"));
    }

    #[tokio::test]
    async fn run_streaming_times_out() {
        let (_client, server) = tokio::io::duplex(4096);
        let mut job = Job::new(Connection::new("test", server));
        let err = run_streaming(
            shell("sleep 5"),
            StageKind::PostUpload,
            Duration::from_millis(100),
            &mut job,
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }
}
