//! Shared scheduling state and the distribution side of the pipeline.
//!
//! [`Context`] owns every queue and host pool. It is created once at startup
//! and handed to the gateway, the build worker and the dispatchers as an
//! `Arc`; nothing here is global.
//!
//! # Flow
//!
//! 1. The gateway pushes [`BuildJob`]s and attack [`DistributionJob`]s
//! 2. The build worker turns each successful build into a TEST job
//! 3. One [`Dispatcher`] per category pairs the next job with the next free
//!    host and hands both to a worker task
//! 4. The worker uploads, flashes and runs the job, then returns the host
//!
//! Every transition ends in [`Context::report`], which snapshots the queues
//! and pools into a [`StatusReport`].

pub mod dispatcher;
pub mod pool;
pub mod queue;
pub mod update;
pub mod variants;

use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::CiConfig;
use crate::job::{BuildJob, Category, DistributionJob, JobSnapshot};
use crate::status::{
    BuildStatus, HostStatus, StatusHub, StatusReport, TestStatus, Update, UpdateType,
};

pub use dispatcher::Dispatcher;
pub use pool::{HostEntry, HostPool};
pub use queue::{InFlight, JobQueue};
pub use update::run_update_ci;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct Context {
    config: CiConfig,
    builds: JobQueue<BuildJob>,
    test_queue: JobQueue<DistributionJob>,
    attack_queue: JobQueue<DistributionJob>,
    test_pool: HostPool,
    attack_pool: HostPool,
    /// Written only by the build worker
    active_build: RwLock<Option<JobSnapshot>>,
    hub: StatusHub,
    /// Held while a report is snapshotted and published, so reports leave
    /// in the order their snapshots were taken
    reporting: Mutex<()>,
}

impl Context {
    /// Returns the context and the receiving end of its status reports.
    pub fn new(config: CiConfig) -> (Self, mpsc::UnboundedReceiver<StatusReport>) {
        let (hub, reports) = StatusHub::new();
        let test_pool = HostPool::new(Category::Test, config.distribution.hosts(Category::Test));
        let attack_pool =
            HostPool::new(Category::Attack, config.distribution.hosts(Category::Attack));
        let ctx = Self {
            config,
            builds: JobQueue::new(),
            test_queue: JobQueue::new(),
            attack_queue: JobQueue::new(),
            test_pool,
            attack_pool,
            active_build: RwLock::new(None),
            hub,
            reporting: Mutex::new(()),
        };
        (ctx, reports)
    }

    pub fn config(&self) -> &CiConfig {
        &self.config
    }

    pub fn builds(&self) -> &JobQueue<BuildJob> {
        &self.builds
    }

    pub fn queue(&self, category: Category) -> &JobQueue<DistributionJob> {
        match category {
            Category::Test => &self.test_queue,
            Category::Attack => &self.attack_queue,
        }
    }

    pub fn pool(&self, category: Category) -> &HostPool {
        match category {
            Category::Test => &self.test_pool,
            Category::Attack => &self.attack_pool,
        }
    }

    /// Both pools, TEST first.
    pub fn pools(&self) -> impl Iterator<Item = &HostPool> {
        Category::ALL.into_iter().map(|category| self.pool(category))
    }

    pub fn status(&self) -> &StatusHub {
        &self.hub
    }

    pub fn active_build(&self) -> Option<JobSnapshot> {
        self.active_build
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_active_build(&self, snapshot: Option<JobSnapshot>) {
        *self
            .active_build
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Snapshot the whole pipeline and publish it.
    pub fn report(&self, kind: UpdateType, state: Option<JobSnapshot>) {
        let _reporting = self
            .reporting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let report = self.build_report(kind, state);
        self.hub.publish(report);
    }

    fn build_report(&self, kind: UpdateType, state: Option<JobSnapshot>) -> StatusReport {
        let active_tests = self
            .pools()
            .flat_map(|pool| pool.hosts())
            .map(|host| HostStatus {
                ip: host.address,
                category: host.category,
                connected: host.connected,
                locked: host.occupant.is_some(),
                active: host.occupant,
            })
            .collect();

        let queue = Category::ALL
            .into_iter()
            .flat_map(|category| self.queue(category).snapshot(DistributionJob::snapshot))
            .collect();

        StatusReport {
            status: state.as_ref().map(|s| s.result),
            update: Update { kind, state },
            build: BuildStatus {
                active: self.active_build(),
                queue: self.builds.snapshot(BuildJob::snapshot),
            },
            test: TestStatus {
                active_tests,
                queue,
            },
        }
    }

    /// No build or distribution job is queued or running.
    ///
    /// Builds are checked first: a finishing build pushes its TEST job before
    /// releasing its in-flight slot, so the job cannot slip between checks.
    pub fn is_drained(&self) -> bool {
        self.builds.is_drained() && Category::ALL.iter().all(|c| self.queue(*c).is_drained())
    }

    /// Wait until [`is_drained`](Self::is_drained) holds.
    pub async fn wait_drained(&self) {
        let mut interval = tokio::time::interval(DRAIN_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if self.is_drained() {
                return;
            }
        }
    }
}
