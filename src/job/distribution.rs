use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use url::Url;

use crate::error::ValidationError;
use crate::job::commit::is_safe_path_component;
use crate::job::{CommitInfo, Connection, Job, JobSnapshot};

/// Partition of the host pool and its job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Test,
    Attack,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Test, Category::Attack];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Test => write!(f, "TEST"),
            Category::Attack => write!(f, "ATTACK"),
        }
    }
}

/// Variant-specific payload of a [`DistributionJob`].
#[derive(Debug)]
pub enum DistributionKind {
    /// Freshly built design: flash it, then run the test suite against it.
    Testing { build_dir: PathBuf },
    /// A team's target on the attack board, attacked with our runner.
    Attacking { team: String, target_dir: PathBuf },
    /// Like `Attacking`, with an operator supplied script as payload.
    AttackScript {
        team: String,
        target_dir: PathBuf,
        script_url: Url,
        /// Download location, kept across re-dispatches.
        script: Option<DownloadedScript>,
    },
}

#[derive(Debug)]
pub struct DownloadedScript {
    pub dir: TempDir,
    pub path: PathBuf,
}

/// An artifact waiting for (or running on) a remote host.
#[derive(Debug)]
pub struct DistributionJob {
    pub job: Job,
    pub name: String,
    pub artifact: PathBuf,
    pub category: Category,
    pub attack_board: bool,
    pub commit: Option<CommitInfo>,
    pub kind: DistributionKind,
}

impl DistributionJob {
    /// Test run for a build staged under `build_dir`.
    ///
    /// `build_dir` holds `build_out/` (the flashed artifact) next to the design
    /// sources and secrets the test runner needs.
    pub fn testing(job: Job, commit: CommitInfo, build_dir: PathBuf) -> Self {
        Self {
            job,
            name: commit.hash.clone(),
            artifact: build_dir.join("build_out"),
            category: Category::Test,
            attack_board: false,
            commit: Some(commit),
            kind: DistributionKind::Testing { build_dir },
        }
    }

    /// Attack run against `team`, whose target lives in `targets_root/<team>`.
    pub fn attacking(
        conn: Connection,
        team: &str,
        targets_root: &Path,
        firmware_image: &str,
    ) -> Result<Self, ValidationError> {
        let target_dir = team_dir(team, targets_root)?;
        Ok(Self {
            job: Job::new(conn),
            name: format!("attack {team}"),
            artifact: target_dir.join(firmware_image),
            category: Category::Attack,
            attack_board: true,
            commit: None,
            kind: DistributionKind::Attacking {
                team: team.to_string(),
                target_dir,
            },
        })
    }

    /// Attack run with a script fetched from `script_url` at dispatch time.
    pub fn attack_script(
        conn: Connection,
        team: &str,
        script_url: &str,
        targets_root: &Path,
        firmware_image: &str,
    ) -> Result<Self, ValidationError> {
        let target_dir = team_dir(team, targets_root)?;
        let script_url = parse_script_url(script_url)?;
        Ok(Self {
            job: Job::new(conn),
            name: format!("attack {team} ({})", script_file_name(&script_url)?),
            artifact: target_dir.join(firmware_image),
            category: Category::Attack,
            attack_board: true,
            commit: None,
            kind: DistributionKind::AttackScript {
                team: team.to_string(),
                target_dir,
                script_url,
                script: None,
            },
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.snapshot(self.commit.as_ref())
    }

    /// Name of the image to flash once the artifact is in the rig's
    /// build_out folder.
    pub fn flash_image<'a>(&'a self, default_image: &'a str) -> &'a str {
        match self.kind {
            DistributionKind::Testing { .. } => default_image,
            DistributionKind::Attacking { .. } | DistributionKind::AttackScript { .. } => self
                .artifact
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(default_image),
        }
    }

    /// Remove local staging that is no longer needed once the job is done.
    pub async fn cleanup(&mut self) {
        match &mut self.kind {
            DistributionKind::Testing { build_dir } => {
                match tokio::fs::remove_dir_all(build_dir.as_path()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(job_id = %self.job.id, path = %build_dir.display(), error = %e, "Failed to remove build folder")
                    }
                }
            }
            DistributionKind::Attacking { .. } => {}
            DistributionKind::AttackScript { script, .. } => {
                // dropping the TempDir deletes it
                script.take();
            }
        }
    }
}

/// Validate a team name and resolve its target folder.
pub fn team_dir(team: &str, targets_root: &Path) -> Result<PathBuf, ValidationError> {
    if !is_safe_path_component(team) {
        return Err(ValidationError::InvalidTeam(team.to_string()));
    }
    Ok(targets_root.join(team))
}

pub fn parse_script_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw).map_err(|_| ValidationError::InvalidScriptUrl(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ValidationError::InvalidScriptUrl(raw.to_string()));
    }
    Ok(url)
}

/// Local file name for a downloaded script: the last path segment.
pub fn script_file_name(url: &Url) -> Result<String, ValidationError> {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    // the name ends up in a remote shell command line
    let plain = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !is_safe_path_component(name) || !plain {
        return Err(ValidationError::InvalidScriptName(name.to_string()));
    }
    Ok(name.to_string())
}
