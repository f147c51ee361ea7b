//! The build half of the pipeline.
//!
//! A single [`BuildWorker`] drains the build queue, so at most one commit is
//! ever being built. Each build runs four stages through a [`Toolchain`]:
//!
//! 1. Sync the checkout to the requested commit
//! 2. Regenerate secrets
//! 3. Build the firmware
//! 4. Stage output, design sources and secrets under the run id
//!
//! The first failing stage ends the job. A successful build hands its client
//! connection to a TEST [`DistributionJob`].

pub mod toolchain;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{StageError, StageKind};
use crate::job::{BuildJob, Category, CommitInfo, DistributionJob, Job, JobStatus};
use crate::scheduler::Context;
use crate::status::UpdateType;

pub use toolchain::ShellToolchain;

/// The local build machinery. Each stage returns whatever it printed.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// One-time setup before the first build.
    async fn prepare(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn sync_repo(&self, commit: &CommitInfo) -> Result<Vec<u8>, StageError>;

    async fn generate_secrets(&self) -> Result<Vec<u8>, StageError>;

    async fn build_firmware(&self) -> Result<Vec<u8>, StageError>;

    /// Copy the build into its own folder and return that folder.
    async fn stage_artifact(&self, commit: &CommitInfo) -> Result<PathBuf, StageError>;
}

enum Failure {
    Stage(StageError),
    ClientGone,
}

impl From<StageError> for Failure {
    fn from(e: StageError) -> Self {
        Failure::Stage(e)
    }
}

fn failure_message(hash: &str, kind: StageKind) -> String {
    let reason = match kind {
        StageKind::RepoSync => "No commit found.",
        StageKind::Secrets => "Failed to build secrets!",
        StageKind::Build => "Build failed!",
        _ => "Failed to stage build output!",
    };
    format!("[BUILD] Failed to build commit {hash}! {reason}")
}

pub struct BuildWorker {
    ctx: Arc<Context>,
    toolchain: Arc<dyn Toolchain>,
}

impl BuildWorker {
    pub fn new(ctx: Arc<Context>, toolchain: Arc<dyn Toolchain>) -> Self {
        Self { ctx, toolchain }
    }

    /// Build queued commits one at a time until `shutdown` fires. A build in
    /// progress is allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Build worker started");
        loop {
            let (build, in_flight) = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.ctx.builds().pop() => next,
            };
            self.build(build).await;
            drop(in_flight);
        }
        tracing::info!("Build worker stopped");
    }

    async fn build(&self, mut build: BuildJob) {
        build.job.stamp_start();
        build.job.advance(JobStatus::Building);
        let snapshot = build.snapshot();
        self.ctx.set_active_build(Some(snapshot.clone()));
        self.ctx.report(UpdateType::Build, Some(snapshot));
        tracing::info!(
            job_id = %build.job.id,
            hash = %build.commit.hash,
            run_id = %build.commit.run_id,
            "Build started"
        );

        let result = self.run_stages(&mut build).await;
        self.ctx.set_active_build(None);

        match result {
            Ok(build_dir) => {
                let BuildJob { job, commit } = build;
                let job = Job::new(job.into_connection());
                let dist = DistributionJob::testing(job, commit, build_dir);
                let snapshot = dist.snapshot();
                self.ctx.queue(Category::Test).push(dist);
                self.ctx.report(UpdateType::Queue, Some(snapshot));
            }
            Err(Failure::Stage(e)) => {
                let message = failure_message(&build.commit.hash, e.kind);
                build.job.fail(&e, &message).await;
                self.ctx.report(UpdateType::Build, Some(build.snapshot()));
            }
            Err(Failure::ClientGone) => {
                build.job.abandon().await;
                self.ctx.report(UpdateType::Build, Some(build.snapshot()));
            }
        }
    }

    async fn run_stages(&self, build: &mut BuildJob) -> Result<PathBuf, Failure> {
        let BuildJob { job, commit } = build;

        job.log("[BUILD] Pulling from repo...").await;
        let output = self.toolchain.sync_repo(commit).await?;
        forward(job, &output).await?;

        job.log("[BUILD] Building secrets...").await;
        let output = self.toolchain.generate_secrets().await?;
        forward(job, &output).await?;

        job.log("[BUILD] Building decoder...").await;
        let output = self.toolchain.build_firmware().await?;
        forward(job, &output).await?;

        let build_dir = self.toolchain.stage_artifact(commit).await?;
        job.log(&format!("[BUILD] Built {}!", commit.hash)).await;
        if job.connection().is_disconnected() {
            discard(&build_dir).await;
            return Err(Failure::ClientGone);
        }
        Ok(build_dir)
    }
}

/// Forward stage output; a client that has gone away ends the build.
async fn forward(job: &mut Job, output: &[u8]) -> Result<(), Failure> {
    job.forward(output).await;
    if job.connection().is_disconnected() {
        return Err(Failure::ClientGone);
    }
    Ok(())
}

async fn discard(build_dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(build_dir).await {
        tracing::debug!(path = %build_dir.display(), error = %e, "Failed to remove abandoned build");
    }
}
