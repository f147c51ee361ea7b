//! Remote rig access: artifact transfer and command execution.
//!
//! Everything the scheduler does to a rig goes through [`HostTransport`].
//! [`SshTransport`] is the production implementation (rsync + ssh); tests
//! substitute their own.
//!
//! Transfer failures are classified by [`classify`] into transient broken
//! pipes, host disconnects and plain failures. The decision rests on the
//! exit code and stderr text of rsync/ssh, which is the only signal those
//! tools give.

pub mod commands;
pub mod ssh;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{StageError, StageKind, TransportError};
use crate::job::Job;
use crate::process::ProcessOutput;

pub use ssh::SshTransport;

#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Copy `sources` into directory `dest` on `host`, replacing its contents.
    /// Directories contribute their contents, files themselves.
    async fn upload(&self, host: &str, sources: &[PathBuf], dest: &str)
        -> Result<(), TransportError>;

    /// Run `command` on `host` and capture its output.
    async fn exec(
        &self,
        host: &str,
        command: &str,
        kind: StageKind,
        timeout: Duration,
    ) -> Result<ProcessOutput, StageError>;

    /// Run `command` on `host`, streaming its output to the job's client.
    async fn exec_streaming(
        &self,
        host: &str,
        command: &str,
        kind: StageKind,
        timeout: Duration,
        job: &mut Job,
    ) -> Result<Vec<u8>, StageError>;
}

const EXIT_REMOTE_SHELL: i32 = 255;

/// Map a failed transfer to a [`TransportError`].
///
/// - `Broken pipe` anywhere in stderr: transient, retry
/// - `Connection closed by <addr> port <n>`, or ssh's own exit code 255 with
///   a connection message: the host is gone
/// - anything else: terminal for the job
pub fn classify(host: &str, output: &ProcessOutput) -> TransportError {
    let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
    let combined = output.combined();

    if stderr.contains("broken pipe") {
        return TransportError::BrokenPipe {
            host: host.to_string(),
            output: combined,
        };
    }

    let closed_on_port = stderr.contains("connection closed") && stderr.contains(" port ");
    let remote_shell_lost = output.exit_code == Some(EXIT_REMOTE_SHELL)
        && (stderr.contains("connection reset") || stderr.contains("connection timed out"));
    if closed_on_port || remote_shell_lost {
        return TransportError::Disconnected {
            host: host.to_string(),
            output: combined,
        };
    }

    TransportError::Failed {
        host: host.to_string(),
        detail: format!("exit code {:?}", output.exit_code),
        output: combined,
    }
}
