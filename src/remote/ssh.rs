use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SshConfig;
use crate::error::{StageError, StageKind, TransportError};
use crate::job::Job;
use crate::process::{self, CaptureError, ProcessOutput};
use crate::remote::{classify, HostTransport};

/// rsync/ssh based access to the rigs.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: SshConfig,
    upload_timeout: Duration,
}

impl SshTransport {
    pub fn new(ssh: SshConfig, upload_timeout: Duration) -> Self {
        Self {
            ssh,
            upload_timeout,
        }
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if let Some(ref config) = self.ssh.config_file {
            opts.push("-F".to_string());
            opts.push(config.display().to_string());
        }
        if let Some(ref identity) = self.ssh.identity {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        opts.push("-o".to_string());
        opts.push("StrictHostKeyChecking=accept-new".to_string());
        opts.push("-o".to_string());
        opts.push("BatchMode=yes".to_string());
        opts
    }

    fn ssh_command(&self, host: &str, remote: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(self.ssh_options()).arg(host).arg(remote);
        command
    }

    /// Arguments for `rsync`, excluding the program name.
    pub fn rsync_args(&self, host: &str, sources: &[PathBuf], dest: &str) -> Vec<String> {
        let mut args = vec![
            format!("--rsh=ssh {}", self.ssh_options().join(" ")),
            // create the destination on the far side first
            format!("--rsync-path=mkdir -p {dest} && rsync"),
            "-a".to_string(),
            "--delete".to_string(),
            "--ignore-times".to_string(),
        ];
        for source in sources {
            let mut path = source.display().to_string();
            if source.is_dir() && !path.ends_with('/') {
                path.push('/');
            }
            args.push(path);
        }
        args.push(format!("{host}:{dest}/"));
        args
    }
}

#[async_trait]
impl HostTransport for SshTransport {
    async fn upload(
        &self,
        host: &str,
        sources: &[PathBuf],
        dest: &str,
    ) -> Result<(), TransportError> {
        let mut command = Command::new("rsync");
        command.args(self.rsync_args(host, sources, dest));

        tracing::debug!(host, dest, sources = sources.len(), "Uploading");
        match process::capture(command, self.upload_timeout).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(classify(host, &output)),
            Err(CaptureError::TimedOut) => Err(TransportError::Failed {
                host: host.to_string(),
                detail: format!("timed out after {}s", self.upload_timeout.as_secs()),
                output: Vec::new(),
            }),
            Err(CaptureError::Spawn(e)) => Err(TransportError::Failed {
                host: host.to_string(),
                detail: format!("failed to spawn rsync: {e}"),
                output: Vec::new(),
            }),
        }
    }

    async fn exec(
        &self,
        host: &str,
        command: &str,
        kind: StageKind,
        timeout: Duration,
    ) -> Result<ProcessOutput, StageError> {
        tracing::debug!(host, command, "Running remote command");
        process::run(self.ssh_command(host, command), kind, timeout).await
    }

    async fn exec_streaming(
        &self,
        host: &str,
        command: &str,
        kind: StageKind,
        timeout: Duration,
        job: &mut Job,
    ) -> Result<Vec<u8>, StageError> {
        tracing::debug!(host, command, "Streaming remote command");
        process::run_streaming(self.ssh_command(host, command), kind, timeout, job).await
    }
}
