use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::job::Category;

/// Where and how firmware is built on this machine.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Clone URL of the design repository, used when `work_dir` is missing
    pub repo_url: Option<String>,
    /// Checkout of the design repository shared by every build
    pub work_dir: PathBuf,
    /// Root of the per-run staging directories
    pub builds_dir: PathBuf,
    pub default_branch: String,
    /// Folder of the checkout holding the decoder sources
    pub design_subdir: String,
    /// Build inside the decoder container instead of `./build.sh`
    pub docker: bool,
    /// Decoder identifier handed to the build
    pub decoder_id: String,
    /// Channels the secret generator is asked for
    pub channels: Vec<u32>,
    pub build_timeout: Duration,
    pub sync_timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            repo_url: None,
            work_dir: PathBuf::from("2025-eCTF-design"),
            builds_dir: PathBuf::from("builds"),
            default_branch: "main".to_string(),
            design_subdir: "decoder".to_string(),
            docker: false,
            decoder_id: "0xdeadbeef".to_string(),
            channels: vec![1, 2, 3, 4],
            build_timeout: Duration::from_secs(10 * 60),
            sync_timeout: Duration::from_secs(2 * 60),
        }
    }
}

/// Paths and entry points on every remote rig.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    /// Shell snippet that activates the rig's Python environment
    pub activate: String,
    /// Upload target for the artifact to flash
    pub build_out: String,
    /// Upload target for design sources and secrets
    pub design_dir: String,
    /// Upload target for attack payloads
    pub attack_dir: String,
    pub update_script: String,
    pub test_runner: String,
    pub attack_runner: String,
    /// Brings the rig's CI checkout up to date
    pub pull_command: String,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            activate: ". ~/ectf2025/.venv/bin/activate".to_string(),
            build_out: "~/ectf2025/build_out".to_string(),
            design_dir: "~/ectf2025/design".to_string(),
            attack_dir: "~/ectf2025/attack".to_string(),
            update_script: "~/ectf2025/CI/update".to_string(),
            test_runner: "~/ectf2025/CI/run-tests".to_string(),
            attack_runner: "~/ectf2025/CI/run-attack".to_string(),
            pull_command: "cd ~/ectf2025 && git pull --ff-only".to_string(),
        }
    }
}

/// SSH options shared by uploads and remote commands.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    /// `-F` config file (proxy commands and the like)
    pub config_file: Option<PathBuf>,
    /// `-i` identity file
    pub identity: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// `user@host` addresses of the test rigs
    pub test_hosts: Vec<String>,
    /// `user@host` addresses of the attack rigs
    pub attack_hosts: Vec<String>,
    pub ssh: SshConfig,
    pub layout: RemoteLayout,
    /// File name of the flashable image inside an artifact folder
    pub firmware_image: String,
    /// Root of the per-team target folders
    pub targets_dir: PathBuf,
    /// Our own pre-built design, uploaded next to every attack
    pub attack_design_binary: PathBuf,
    pub test_scenario: String,
    pub attack_scenario: String,
    pub upload_attempts: u32,
    pub upload_timeout: Duration,
    pub flash_timeout: Duration,
    pub run_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Per-host limit for the update-ci refresh
    pub update_timeout: Duration,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            test_hosts: Vec::new(),
            attack_hosts: Vec::new(),
            ssh: SshConfig::default(),
            layout: RemoteLayout::default(),
            firmware_image: "max78000.bin".to_string(),
            targets_dir: PathBuf::from("targets"),
            attack_design_binary: PathBuf::from("designs/max78000.bin"),
            test_scenario: "1".to_string(),
            attack_scenario: "1".to_string(),
            upload_attempts: 3,
            upload_timeout: Duration::from_secs(2 * 60),
            flash_timeout: Duration::from_secs(4 * 60),
            run_timeout: Duration::from_secs(10 * 60),
            fetch_timeout: Duration::from_secs(30),
            update_timeout: Duration::from_secs(2 * 60),
        }
    }
}

impl DistributionConfig {
    pub fn hosts(&self, category: Category) -> &[String] {
        match category {
            Category::Test => &self.test_hosts,
            Category::Attack => &self.attack_hosts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CiConfig {
    pub listen_addr: SocketAddr,
    /// Shared secret every request must start with
    pub auth_token: String,
    /// Serve the latest status report over HTTP
    pub dashboard_addr: Option<SocketAddr>,
    /// Dashboard collaborator that receives every status report
    pub webhook_url: Option<String>,
    /// Per-frame read timeout on client connections
    pub read_timeout: Duration,
    pub build: BuildConfig,
    pub distribution: DistributionConfig,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8888)),
            auth_token: String::new(),
            dashboard_addr: None,
            webhook_url: None,
            read_timeout: Duration::from_secs(10),
            build: BuildConfig::default(),
            distribution: DistributionConfig::default(),
        }
    }
}

impl CiConfig {
    pub fn new(listen_addr: SocketAddr, auth_token: impl Into<String>) -> Self {
        Self {
            listen_addr,
            auth_token: auth_token.into(),
            ..Default::default()
        }
    }

    pub fn with_host(mut self, category: Category, addr: impl Into<String>) -> Self {
        match category {
            Category::Test => self.distribution.test_hosts.push(addr.into()),
            Category::Attack => self.distribution.attack_hosts.push(addr.into()),
        }
        self
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth_token.is_empty() {
            return Err("auth token must not be empty".to_string());
        }
        if self.distribution.upload_attempts == 0 {
            return Err("upload attempts must be at least 1".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for host in self
            .distribution
            .test_hosts
            .iter()
            .chain(&self.distribution.attack_hosts)
        {
            if !seen.insert(host) {
                return Err(format!("host {host} is listed more than once"));
            }
        }
        Ok(())
    }
}

/// Split a comma separated host list, ignoring blanks.
pub fn parse_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_default() {
        let cfg = BuildConfig::default();
        assert_eq!(cfg.default_branch, "main");
        assert_eq!(cfg.channels, vec![1, 2, 3, 4]);
        assert_eq!(cfg.build_timeout, Duration::from_secs(600));
        assert!(!cfg.docker);
    }

    #[test]
    fn distribution_config_default_timeouts() {
        let cfg = DistributionConfig::default();
        assert_eq!(cfg.upload_attempts, 3);
        assert_eq!(cfg.flash_timeout, Duration::from_secs(240));
        assert_eq!(cfg.run_timeout, Duration::from_secs(600));
        assert!(cfg.test_hosts.is_empty());
        assert!(cfg.attack_hosts.is_empty());
    }

    #[test]
    fn ci_config_default() {
        let cfg = CiConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8888");
        assert!(cfg.dashboard_addr.is_none());
        assert!(cfg.webhook_url.is_none());
        assert_eq!(cfg.read_timeout, Duration::from_secs(10));
    }

    #[test]
    fn ci_config_with_hosts() {
        let cfg = CiConfig::new("0.0.0.0:9000".parse().unwrap(), "secret")
            .with_host(Category::Test, "ci@rig1")
            .with_host(Category::Test, "ci@rig2")
            .with_host(Category::Attack, "ci@board");
        assert_eq!(cfg.auth_token, "secret");
        assert_eq!(cfg.distribution.hosts(Category::Test), ["ci@rig1", "ci@rig2"]);
        assert_eq!(cfg.distribution.hosts(Category::Attack), ["ci@board"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_token() {
        let cfg = CiConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_host_in_two_categories() {
        let cfg = CiConfig::new("0.0.0.0:9000".parse().unwrap(), "secret")
            .with_host(Category::Test, "ci@rig1")
            .with_host(Category::Attack, "ci@rig1");
        assert!(cfg
            .validate()
            .unwrap_err()
            .contains("more than once"));
    }

    #[test]
    fn parse_hosts_skips_blanks() {
        assert_eq!(
            parse_hosts("ci@rig1, ci@rig2,,"),
            vec!["ci@rig1".to_string(), "ci@rig2".to_string()]
        );
        assert!(parse_hosts("").is_empty());
    }
}
