use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hwci::config::{parse_hosts, CiConfig, SshConfig};
use hwci::node::Node;
use hwci::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "hwci")]
#[command(version)]
#[command(about = "Hardware-in-the-loop CI server: builds firmware and runs it on remote rigs")]
struct Args {
    /// Address to bind the request listener to
    #[arg(long, env = "HWCI_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Port for CI requests
    #[arg(long, env = "HWCI_PORT", default_value = "8888")]
    port: u16,

    /// Shared secret every request must start with
    #[arg(long, env = "HWCI_TOKEN", hide_env_values = true)]
    token: String,

    /// Port for the status dashboard (optional)
    #[arg(long, env = "HWCI_DASHBOARD_PORT")]
    dashboard_port: Option<u16>,

    /// URL that receives every status report as JSON
    #[arg(long, env = "HWCI_WEBHOOK")]
    webhook: Option<String>,

    /// Test rigs (comma-separated, format: "user@host")
    #[arg(long, env = "HWCI_TEST_HOSTS", default_value = "")]
    test_hosts: String,

    /// Attack rigs (comma-separated, format: "user@host")
    #[arg(long, env = "HWCI_ATTACK_HOSTS", default_value = "")]
    attack_hosts: String,

    /// Build inside the decoder container instead of ./build.sh
    #[arg(long, env = "HWCI_DOCKER", value_parser = clap::builder::BoolishValueParser::new())]
    docker: bool,

    /// Checkout of the design repository
    #[arg(long, env = "HWCI_WORK_DIR", default_value = "2025-eCTF-design")]
    work_dir: PathBuf,

    /// Clone URL used when the checkout is missing
    #[arg(long, env = "HWCI_REPO_URL")]
    repo_url: Option<String>,

    /// Root of the per-run build folders
    #[arg(long, env = "HWCI_BUILDS_DIR", default_value = "builds")]
    builds_dir: PathBuf,

    /// Root of the per-team attack targets
    #[arg(long, env = "HWCI_TARGETS_DIR", default_value = "targets")]
    targets_dir: PathBuf,

    /// Our pre-built design, uploaded with every attack
    #[arg(long, env = "HWCI_ATTACK_DESIGN", default_value = "designs/max78000.bin")]
    attack_design: PathBuf,

    /// Decoder id handed to the build
    #[arg(long, env = "HWCI_DECODER_ID", default_value = "0xdeadbeef")]
    decoder_id: String,

    /// ssh config file for the rigs
    #[arg(long, env = "HWCI_SSH_CONFIG")]
    ssh_config: Option<PathBuf>,

    /// ssh identity file for the rigs
    #[arg(long, env = "HWCI_SSH_IDENTITY")]
    ssh_identity: Option<PathBuf>,

    /// Firmware build timeout in seconds
    #[arg(long, default_value = "600")]
    build_timeout: u64,

    /// Remote test/attack run timeout in seconds
    #[arg(long, default_value = "600")]
    run_timeout: u64,
}

impl Args {
    fn into_config(self) -> CiConfig {
        let mut config = CiConfig::new(SocketAddr::new(self.bind, self.port), self.token);
        config.dashboard_addr = self
            .dashboard_port
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        config.webhook_url = self.webhook;

        config.build.work_dir = self.work_dir;
        config.build.repo_url = self.repo_url;
        config.build.builds_dir = self.builds_dir;
        config.build.docker = self.docker;
        config.build.decoder_id = self.decoder_id;
        config.build.build_timeout = Duration::from_secs(self.build_timeout);

        let dist = &mut config.distribution;
        dist.test_hosts = parse_hosts(&self.test_hosts);
        dist.attack_hosts = parse_hosts(&self.attack_hosts);
        dist.targets_dir = self.targets_dir;
        dist.attack_design_binary = self.attack_design;
        dist.run_timeout = Duration::from_secs(self.run_timeout);
        dist.ssh = SshConfig {
            config_file: self.ssh_config,
            identity: self.ssh_identity,
        };
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        test_hosts = ?config.distribution.test_hosts,
        attack_hosts = ?config.distribution.attack_hosts,
        docker = config.build.docker,
        webhook = config.webhook_url.is_some(),
        "Starting hwci"
    );
    if config.distribution.test_hosts.is_empty() {
        tracing::warn!("No test hosts configured, builds will queue forever");
    }

    let shutdown = install_shutdown_handler()?;
    let node = Node::new(config)?;
    node.run(shutdown).await?;
    Ok(())
}
