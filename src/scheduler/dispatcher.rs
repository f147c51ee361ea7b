use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DistributionConfig;
use crate::error::{StageError, StageKind, TransportError};
use crate::job::{Category, DistributionJob, Job, JobStatus};
use crate::remote::{commands, HostTransport};
use crate::scheduler::{Context, InFlight};
use crate::status::UpdateType;

/// Pairs queued jobs of one category with free hosts of that category.
pub struct Dispatcher {
    ctx: Arc<Context>,
    transport: Arc<dyn HostTransport>,
    category: Category,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>, transport: Arc<dyn HostTransport>, category: Category) -> Self {
        Self {
            ctx,
            transport,
            category,
        }
    }

    /// Dispatch until `shutdown` fires. Workers still running at that point
    /// are aborted.
    pub async fn run(self, shutdown: CancellationToken) {
        let queue = self.ctx.queue(self.category);
        let pool = self.ctx.pool(self.category);
        tracing::info!(category = %self.category, hosts = pool.len(), "Dispatcher started");

        let mut workers = JoinSet::new();
        loop {
            let (mut dist, in_flight) = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = queue.pop() => next,
            };

            let host = tokio::select! {
                _ = shutdown.cancelled() => {
                    queue.push(dist);
                    drop(in_flight);
                    break;
                }
                host = pool.acquire(dist.snapshot()) => host,
            };

            dist.job.stamp_start();
            dist.job.advance(JobStatus::Uploading);
            let snapshot = dist.snapshot();
            pool.update_occupant(&host, snapshot.clone());
            self.ctx.report(UpdateType::Test, Some(snapshot));
            tracing::info!(
                job_id = %dist.job.id,
                category = %self.category,
                host = %host,
                name = %dist.name,
                "Dispatching job"
            );

            let worker = DistributionWorker {
                ctx: self.ctx.clone(),
                transport: self.transport.clone(),
                host,
            };
            workers.spawn(worker.run(dist, in_flight));

            while let Some(finished) = workers.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!(category = %self.category, error = %e, "Distribution worker panicked");
                }
            }
        }

        if !workers.is_empty() {
            tracing::warn!(category = %self.category, running = workers.len(), "Aborting distribution workers");
        }
        workers.shutdown().await;
        tracing::info!(category = %self.category, "Dispatcher stopped");
    }
}

/// Why a distribution stopped before the end.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// The host went away; the job goes back in the queue.
    HostLost,
    /// The client went away; nothing left to report to.
    ClientGone,
    Stage(StageError),
}

impl From<StageError> for Interrupt {
    fn from(e: StageError) -> Self {
        Interrupt::Stage(e)
    }
}

/// Runs one job on one host.
pub(crate) struct DistributionWorker {
    pub(crate) ctx: Arc<Context>,
    pub(crate) transport: Arc<dyn HostTransport>,
    pub(crate) host: String,
}

impl DistributionWorker {
    pub(crate) fn config(&self) -> &DistributionConfig {
        &self.ctx.config().distribution
    }

    async fn run(self, mut dist: DistributionJob, in_flight: InFlight) {
        let category = dist.category;
        let pool = self.ctx.pool(category);

        match self.distribute(&mut dist).await {
            Ok(()) => dist.job.succeed().await,
            Err(Interrupt::HostLost) => {
                pool.retire(&self.host);
                // log only: the client just sees the upload restart
                tracing::warn!(
                    job_id = %dist.job.id,
                    category = %category,
                    host = %self.host,
                    name = %dist.name,
                    "Lost connection to host, requeueing job"
                );
                dist.job.requeue();
                let snapshot = dist.snapshot();
                // pushed before the in-flight slot is released so drain
                // checks never miss it
                self.ctx.queue(category).push(dist);
                drop(in_flight);
                self.ctx.report(UpdateType::Queue, Some(snapshot));
                return;
            }
            Err(Interrupt::ClientGone) => dist.job.abandon().await,
            Err(Interrupt::Stage(e)) => {
                let message = format!("[{category}] {} failed on {}!", dist.name, self.host);
                dist.job.fail(&e, &message).await;
            }
        }

        let snapshot = dist.snapshot();
        pool.release(&self.host);
        dist.cleanup().await;
        drop(in_flight);
        self.ctx.report(UpdateType::Test, Some(snapshot));
    }

    async fn distribute(&self, dist: &mut DistributionJob) -> Result<(), Interrupt> {
        let category = dist.category;
        dist.job
            .log(&format!("[{category}] Uploading {}...", dist.name))
            .await;
        let remote_out = self.config().layout.build_out.clone();
        let artifact = dist.artifact.clone();
        self.upload(&mut dist.job, &[artifact], &remote_out).await?;
        self.check_client(&dist.job)?;

        dist.job
            .log(&format!("[{category}] Uploaded! Flashing {}...", dist.name))
            .await;
        let flash = commands::flash(
            &self.config().layout,
            dist.flash_image(&self.config().firmware_image),
            dist.attack_board,
        );
        let output = self
            .transport
            .exec(&self.host, &flash, StageKind::Flash, self.config().flash_timeout)
            .await?;
        dist.job.forward(&output.combined()).await;
        self.check_client(&dist.job)?;

        self.post_upload(dist).await?;
        self.check_client(&dist.job)
    }

    /// Upload with a bounded retry on broken pipes.
    pub(crate) async fn upload(
        &self,
        job: &mut Job,
        sources: &[PathBuf],
        dest: &str,
    ) -> Result<(), Interrupt> {
        let attempts = self.config().upload_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transport.upload(&self.host, sources, dest).await {
                Ok(()) => return Ok(()),
                Err(TransportError::BrokenPipe { .. }) if attempt < attempts => {
                    tracing::warn!(job_id = %job.id, host = %self.host, attempt, "Broken pipe during upload, retrying");
                    job.log(&format!(
                        "Broken pipe uploading to {}, retrying ({attempt}/{attempts})",
                        self.host
                    ))
                    .await;
                    attempt += 1;
                }
                Err(TransportError::Disconnected { .. }) => return Err(Interrupt::HostLost),
                Err(e) => return Err(Interrupt::Stage(e.into_stage_error())),
            }
        }
    }

    pub(crate) fn check_client(&self, job: &Job) -> Result<(), Interrupt> {
        if job.connection().is_disconnected() {
            Err(Interrupt::ClientGone)
        } else {
            Ok(())
        }
    }
}
