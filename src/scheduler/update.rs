use std::sync::Arc;

use crate::error::StageKind;
use crate::job::{JobStatus, UpdateCiJob};
use crate::remote::{commands, HostTransport};
use crate::scheduler::Context;
use crate::status::UpdateType;

/// Refresh the CI checkout on every connected host once the pipeline is
/// idle.
///
/// Waits for the build queue and both distribution queues to drain, then
/// updates hosts one at a time, TEST pool first, each pool in startup order.
/// Retired hosts are skipped. The first failing host ends the job.
pub async fn run_update_ci(
    ctx: Arc<Context>,
    transport: Arc<dyn HostTransport>,
    mut update: UpdateCiJob,
) {
    let job = &mut update.job;
    job.log("[UPDATE] Waiting for queued jobs to finish...").await;
    ctx.report(UpdateType::Queue, Some(job.snapshot(None)));
    ctx.wait_drained().await;

    if job.connection().is_disconnected() {
        job.abandon().await;
        return;
    }

    job.stamp_start();
    job.advance(JobStatus::Uploading);
    ctx.report(UpdateType::Test, Some(job.snapshot(None)));

    let layout = &ctx.config().distribution.layout;
    let timeout = ctx.config().distribution.update_timeout;
    let command = commands::pull_latest(layout);

    for pool in ctx.pools() {
        for host in pool.hosts() {
            if !host.connected {
                tracing::warn!(host = %host.address, category = %host.category, "Skipping disconnected host");
                job.log(&format!("[UPDATE] Skipping disconnected host {}", host.address))
                    .await;
                continue;
            }

            job.log(&format!("[UPDATE] Updating {}...", host.address)).await;
            let result = transport
                .exec_streaming(&host.address, &command, StageKind::HostUpdate, timeout, job)
                .await;
            if let Err(e) = result {
                job.fail(&e, &format!("[UPDATE] Failed to update {}!", host.address))
                    .await;
                ctx.report(UpdateType::Test, Some(job.snapshot(None)));
                return;
            }
        }
    }

    job.log("[UPDATE] All hosts updated!").await;
    job.succeed().await;
    ctx.report(UpdateType::Test, Some(job.snapshot(None)));
}
