//! Aggregate status pushed to the dashboard after every transition.
//!
//! The scheduler builds a [`StatusReport`] from its [`Context`] and hands it to
//! [`StatusHub::publish`]. The hub keeps the latest report for the local
//! dashboard and forwards every report, in order, to a [`StatusReporter`]
//! running on its own task, so a slow webhook never stalls a worker.
//!
//! [`Context`]: crate::scheduler::Context

pub mod dashboard;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::job::{Category, JobSnapshot, JobStatus};

/// Which part of the pipeline the update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Queue,
    Build,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: UpdateType,
    pub state: Option<JobSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub active: Option<JobSnapshot>,
    pub queue: Vec<JobSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub ip: String,
    pub category: Category,
    pub connected: bool,
    pub locked: bool,
    pub active: Option<JobSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatus {
    pub active_tests: Vec<HostStatus>,
    pub queue: Vec<JobSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub update: Update,
    pub status: Option<JobStatus>,
    pub build: BuildStatus,
    pub test: TestStatus,
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            update: Update {
                kind: UpdateType::Queue,
                state: None,
            },
            status: None,
            build: BuildStatus::default(),
            test: TestStatus::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Consumer of status reports.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn publish(&self, report: &StatusReport) -> Result<(), ReportError>;
}

/// Posts every report as JSON to the dashboard's webhook.
#[derive(Debug, Clone)]
pub struct WebhookReporter {
    client: reqwest::Client,
    url: String,
}

impl WebhookReporter {
    pub fn new(url: impl Into<String>) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl StatusReporter for WebhookReporter {
    async fn publish(&self, report: &StatusReport) -> Result<(), ReportError> {
        self.client
            .post(&self.url)
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn publish(&self, report: &StatusReport) -> Result<(), ReportError> {
        tracing::debug!(
            update = ?report.update.kind,
            status = ?report.status,
            build_queue = report.build.queue.len(),
            test_queue = report.test.queue.len(),
            "Status update"
        );
        Ok(())
    }
}

/// Fan-out point for status reports.
#[derive(Debug)]
pub struct StatusHub {
    latest: watch::Sender<StatusReport>,
    outbox: mpsc::UnboundedSender<StatusReport>,
}

impl StatusHub {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusReport>) {
        let (latest, _) = watch::channel(StatusReport::default());
        let (outbox, rx) = mpsc::unbounded_channel();
        (Self { latest, outbox }, rx)
    }

    pub fn publish(&self, report: StatusReport) {
        self.latest.send_replace(report.clone());
        if self.outbox.send(report).is_err() {
            tracing::trace!("Status publisher gone, report dropped");
        }
    }

    pub fn latest(&self) -> StatusReport {
        self.latest.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusReport> {
        self.latest.subscribe()
    }
}

/// Deliver reports to `reporter` until every hub is dropped. Delivery errors
/// are logged and never retried.
pub async fn run_publisher(
    mut rx: mpsc::UnboundedReceiver<StatusReport>,
    reporter: Arc<dyn StatusReporter>,
) {
    while let Some(report) = rx.recv().await {
        if let Err(e) = reporter.publish(&report).await {
            tracing::warn!(error = %e, "Failed to push status update");
        }
    }
}
