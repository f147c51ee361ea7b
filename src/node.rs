use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::builder::{BuildWorker, ShellToolchain, Toolchain};
use crate::config::CiConfig;
use crate::error::{CiError, Result};
use crate::gateway::Gateway;
use crate::job::Category;
use crate::remote::{HostTransport, SshTransport};
use crate::scheduler::{Context, Dispatcher};
use crate::status::dashboard::{run_dashboard, DashboardState};
use crate::status::{run_publisher, LogReporter, StatusReport, StatusReporter, WebhookReporter};

/// The CI server: context plus the collaborators every task shares.
pub struct Node {
    ctx: Arc<Context>,
    reports: mpsc::UnboundedReceiver<StatusReport>,
    transport: Arc<dyn HostTransport>,
    toolchain: Arc<dyn Toolchain>,
    reporter: Arc<dyn StatusReporter>,
}

impl Node {
    /// Production wiring: ssh/rsync to the rigs, shell builds, webhook
    /// reports when a URL is configured.
    pub fn new(config: CiConfig) -> Result<Self> {
        config.validate().map_err(CiError::Config)?;

        let transport = Arc::new(SshTransport::new(
            config.distribution.ssh.clone(),
            config.distribution.upload_timeout,
        ));
        let toolchain = Arc::new(ShellToolchain::new(config.build.clone()));
        let reporter: Arc<dyn StatusReporter> = match &config.webhook_url {
            Some(url) => Arc::new(
                WebhookReporter::new(url.clone()).map_err(|e| CiError::Config(e.to_string()))?,
            ),
            None => Arc::new(LogReporter),
        };

        Ok(Self::with_parts(config, transport, toolchain, reporter))
    }

    pub fn with_parts(
        config: CiConfig,
        transport: Arc<dyn HostTransport>,
        toolchain: Arc<dyn Toolchain>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        let (ctx, reports) = Context::new(config);
        Self {
            ctx: Arc::new(ctx),
            reports,
            transport,
            toolchain,
            reporter,
        }
    }

    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.ctx.config().listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    ///
    /// 1. Prepares the build toolchain (fatal on failure)
    /// 2. Spawns the status publisher
    /// 3. Spawns the build worker and one dispatcher per category
    /// 4. Optionally spawns the dashboard
    /// 5. Runs the gateway until shutdown, then waits for the workers
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.toolchain.prepare().await?;
        tracing::info!("Build toolchain ready");

        tokio::spawn(run_publisher(self.reports, self.reporter.clone()));

        let mut workers = Vec::new();
        let builder = BuildWorker::new(self.ctx.clone(), self.toolchain.clone());
        workers.push(tokio::spawn(builder.run(shutdown.clone())));
        for category in Category::ALL {
            let dispatcher = Dispatcher::new(self.ctx.clone(), self.transport.clone(), category);
            workers.push(tokio::spawn(dispatcher.run(shutdown.clone())));
        }

        if let Some(addr) = self.ctx.config().dashboard_addr {
            let state = DashboardState {
                ctx: self.ctx.clone(),
            };
            tokio::spawn(run_dashboard(addr, state));
        }

        let gateway = Gateway::new(self.ctx.clone(), self.transport.clone());
        gateway.run(listener, shutdown).await;

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
        tracing::info!("CI server stopped");
        Ok(())
    }
}
