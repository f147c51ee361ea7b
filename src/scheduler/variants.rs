//! What happens on the host after the artifact is flashed.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{StageError, StageKind};
use crate::job::distribution::{script_file_name, DownloadedScript};
use crate::job::{DistributionJob, DistributionKind, Job, JobStatus};
use crate::remote::commands;
use crate::scheduler::dispatcher::{DistributionWorker, Interrupt};
use crate::status::UpdateType;

static FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ectf\{[^}]*\}").expect("flag pattern is valid")
});

impl DistributionWorker {
    pub(crate) async fn post_upload(&self, dist: &mut DistributionJob) -> Result<(), Interrupt> {
        let next = match dist.kind {
            DistributionKind::Testing { .. } => JobStatus::Testing,
            DistributionKind::Attacking { .. } | DistributionKind::AttackScript { .. } => {
                JobStatus::Attacking
            }
        };
        dist.job.advance(next);
        let snapshot = dist.snapshot();
        self.ctx
            .pool(dist.category)
            .update_occupant(&self.host, snapshot.clone());
        self.ctx.report(UpdateType::Test, Some(snapshot));

        let DistributionJob { job, kind, .. } = dist;
        match kind {
            DistributionKind::Testing { build_dir } => {
                let build_dir = build_dir.clone();
                self.run_tests(job, build_dir).await
            }
            DistributionKind::Attacking { team, target_dir } => {
                let payload =
                    attack_payload(target_dir, &self.config().attack_design_binary).await?;
                let command =
                    commands::run_attack(&self.config().layout, &self.config().attack_scenario);
                let team = team.clone();
                self.run_attack(job, &team, payload, &command).await
            }
            DistributionKind::AttackScript {
                team,
                target_dir,
                script_url,
                script,
            } => {
                let mut payload =
                    attack_payload(target_dir, &self.config().attack_design_binary).await?;
                // kept across re-dispatches, fetched once
                if script.is_none() {
                    job.log(&format!("[ATTACK] Downloading {script_url}...")).await;
                    *script = Some(self.fetch_script(script_url).await?);
                }
                if let Some(downloaded) = script.as_ref() {
                    payload.push(downloaded.path.clone());
                }
                let name = script_file_name(script_url).map_err(fetch_error)?;
                let command = commands::run_script(&self.config().layout, &name);
                let team = team.clone();
                self.run_attack(job, &team, payload, &command).await
            }
        }
    }

    async fn run_tests(&self, job: &mut Job, build_dir: PathBuf) -> Result<(), Interrupt> {
        job.log("[TEST] Uploading design and secrets...").await;
        let design = self.config().layout.design_dir.clone();
        self.upload(job, &[build_dir], &design).await?;
        self.check_client(job)?;

        job.log("[TEST] Running tests...").await;
        let command = commands::run_tests(&self.config().layout, &self.config().test_scenario);
        self.transport
            .exec_streaming(
                &self.host,
                &command,
                StageKind::PostUpload,
                self.config().run_timeout,
                job,
            )
            .await?;
        job.log("[TEST] Tests OK!").await;
        Ok(())
    }

    async fn run_attack(
        &self,
        job: &mut Job,
        team: &str,
        payload: Vec<PathBuf>,
        command: &str,
    ) -> Result<(), Interrupt> {
        job.log(&format!("[ATTACK] Uploading attack payload for {team}..."))
            .await;
        let attack_dir = self.config().layout.attack_dir.clone();
        self.upload(job, &payload, &attack_dir).await?;
        self.check_client(job)?;

        job.log(&format!("[ATTACK] Attacking {team}...")).await;
        let output = self
            .transport
            .exec_streaming(
                &self.host,
                command,
                StageKind::PostUpload,
                self.config().run_timeout,
                job,
            )
            .await?;

        let flags = scan_flags(&String::from_utf8_lossy(&output));
        if flags.is_empty() {
            job.log(&format!("[ATTACK] No flags captured from {team}")).await;
        }
        for flag in flags {
            tracing::info!(job_id = %job.id, team = %team, flag = %flag, "Flag captured");
            job.log(&format!("[ATTACK] Captured flag {flag}")).await;
        }
        Ok(())
    }

    async fn fetch_script(&self, url: &url::Url) -> Result<DownloadedScript, StageError> {
        let name = script_file_name(url).map_err(fetch_error)?;

        let client = reqwest::Client::builder()
            .timeout(self.config().fetch_timeout)
            .build()
            .map_err(fetch_error)?;
        let body = client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(fetch_error)?
            .bytes()
            .await
            .map_err(fetch_error)?;

        let dir = tempfile::tempdir()
            .map_err(|e| StageError::new(StageKind::Fetch, format!("temp dir: {e}")))?;
        let path = dir.path().join(&name);
        tokio::fs::write(&path, &body).await.map_err(|e| {
            StageError::new(StageKind::Fetch, format!("write {}: {e}", path.display()))
        })?;
        tracing::debug!(url = %url, path = %path.display(), bytes = body.len(), "Script downloaded");
        Ok(DownloadedScript { dir, path })
    }
}

fn fetch_error(e: impl std::fmt::Display) -> StageError {
    StageError::new(StageKind::Fetch, e.to_string())
}

/// The team's non-hidden regular files, sorted, then our design binary.
async fn attack_payload(
    target_dir: &Path,
    design_binary: &Path,
) -> Result<Vec<PathBuf>, StageError> {
    let staging = |e: std::io::Error| {
        StageError::new(StageKind::Staging, format!("{}: {e}", target_dir.display()))
    };
    let mut entries = tokio::fs::read_dir(target_dir).await.map_err(staging)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(staging)? {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !entry.file_type().await.map_err(staging)?.is_file() {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    files.push(design_binary.to_path_buf());
    Ok(files)
}

/// Distinct flags in order of first appearance.
pub fn scan_flags(output: &str) -> Vec<String> {
    let mut flags: Vec<String> = Vec::new();
    for found in FLAG.find_iter(output) {
        if !flags.iter().any(|f| f == found.as_str()) {
            flags.push(found.as_str().to_string());
        }
    }
    flags
}
