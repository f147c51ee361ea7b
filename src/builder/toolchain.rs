use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::builder::Toolchain;
use crate::config::BuildConfig;
use crate::error::{StageError, StageKind};
use crate::job::CommitInfo;
use crate::process::{run, shell, ProcessOutput};

const BUILD_OUT: &str = "build_out";
const SECRETS: &str = "secrets";

/// Builds with git, the design's Python tooling and its build script (or
/// container) in a local checkout.
#[derive(Debug, Clone)]
pub struct ShellToolchain {
    config: BuildConfig,
}

impl ShellToolchain {
    pub fn new(config: BuildConfig) -> Self {
        Self { config }
    }

    fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    fn git(&self, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command.args(args).current_dir(self.work_dir());
        command
    }

    fn in_checkout(&self, script: &str) -> Command {
        let mut command = shell(script);
        command.current_dir(self.work_dir());
        command
    }

    fn secrets_command(&self) -> String {
        let channels = self
            .config
            .channels
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "if [ -f .venv/bin/activate ]; then . ./.venv/bin/activate; fi; \
             python -m ectf25_design.gen_secrets {SECRETS}/secrets.json {channels}"
        )
    }

    fn build_command(&self) -> Command {
        let mut command = if self.config.docker {
            let design = &self.config.design_subdir;
            self.in_checkout(&format!(
                "docker build -t build-decoder ./{design} && \
                 docker run --rm -v ./{BUILD_OUT}:/out -v ./{design}/:/decoder \
                 -v ./{SECRETS}/secrets.json:/secrets/secrets.json:ro \
                 -e DECODER_ID={} build-decoder",
                self.config.decoder_id
            ))
        } else {
            self.in_checkout("./build.sh")
        };
        command
            .env("DECODER_ID", &self.config.decoder_id)
            .env("SECRETS", self.work_dir().join(SECRETS).join("secrets.json"));
        command
    }
}

fn collect(outputs: &[ProcessOutput]) -> Vec<u8> {
    outputs.iter().flat_map(ProcessOutput::combined).collect()
}

async fn reset_dir(path: &Path, kind: StageKind) -> Result<(), StageError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(StageError::new(kind, format!("remove {}: {e}", path.display()))),
    }
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| StageError::new(kind, format!("create {}: {e}", path.display())))
}

async fn is_empty_dir(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => true,
    }
}

#[async_trait]
impl Toolchain for ShellToolchain {
    async fn prepare(&self) -> Result<(), StageError> {
        if !self.work_dir().exists() {
            let Some(url) = &self.config.repo_url else {
                return Err(StageError::new(
                    StageKind::RepoSync,
                    format!(
                        "no checkout at {} and no repository url",
                        self.work_dir().display()
                    ),
                ));
            };
            tracing::info!(url = %url, dir = %self.work_dir().display(), "Cloning design repository");
            let mut clone = Command::new("git");
            clone.arg("clone").arg(url).arg(self.work_dir());
            run(clone, StageKind::RepoSync, self.config.sync_timeout).await?;
        } else {
            tracing::info!(dir = %self.work_dir().display(), "Found existing checkout, reusing");
        }
        reset_dir(&self.config.builds_dir, StageKind::Staging).await
    }

    async fn sync_repo(&self, commit: &CommitInfo) -> Result<Vec<u8>, StageError> {
        let branch = self.config.default_branch.as_str();
        let upstream = format!("origin/{branch}");
        let steps: [&[&str]; 5] = [
            &["reset", "--hard"],
            &["checkout", branch],
            &["fetch", "origin"],
            &["reset", "--hard", upstream.as_str()],
            &["checkout", commit.hash.as_str()],
        ];

        let mut outputs = Vec::with_capacity(steps.len());
        for args in steps {
            let output = run(self.git(args), StageKind::RepoSync, self.config.sync_timeout)
                .await
                .map_err(|e| {
                    let mut output = collect(&outputs);
                    output.extend_from_slice(&e.output);
                    StageError::new(e.kind, format!("git {}: {}", args.join(" "), e.detail))
                        .with_output(output)
                })?;
            outputs.push(output);
        }
        Ok(collect(&outputs))
    }

    async fn generate_secrets(&self) -> Result<Vec<u8>, StageError> {
        reset_dir(&self.work_dir().join(SECRETS), StageKind::Secrets).await?;
        let output = run(
            self.in_checkout(&self.secrets_command()),
            StageKind::Secrets,
            self.config.sync_timeout,
        )
        .await?;
        Ok(output.combined())
    }

    async fn build_firmware(&self) -> Result<Vec<u8>, StageError> {
        let out_dir = self.work_dir().join(BUILD_OUT);
        reset_dir(&out_dir, StageKind::Build).await?;
        let output = run(self.build_command(), StageKind::Build, self.config.build_timeout).await?;
        if is_empty_dir(&out_dir).await {
            return Err(StageError::new(StageKind::Build, "build produced no output")
                .with_output(output.combined()));
        }
        Ok(output.combined())
    }

    async fn stage_artifact(&self, commit: &CommitInfo) -> Result<PathBuf, StageError> {
        let staged = self.config.builds_dir.join(&commit.run_id);
        reset_dir(&staged, StageKind::Staging).await?;

        let copies = [
            (self.work_dir().join(BUILD_OUT), staged.join(BUILD_OUT)),
            (self.work_dir().join(&self.config.design_subdir), staged.join("design")),
            (self.work_dir().join(SECRETS), staged.join(SECRETS)),
        ];
        for (from, to) in copies {
            tokio::fs::create_dir_all(&to).await.map_err(|e| {
                StageError::new(StageKind::Staging, format!("create {}: {e}", to.display()))
            })?;
            let mut copy = Command::new("cp");
            copy.arg("-a").arg(from.join(".")).arg(&to);
            run(copy, StageKind::Staging, self.config.sync_timeout).await?;
        }
        tracing::debug!(run_id = %commit.run_id, dir = %staged.display(), "Build staged");
        Ok(staged)
    }
}
