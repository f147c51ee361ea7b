//! Job records shared by every stage of the pipeline.
//!
//! A [`Job`] is the common core: status, start time and the client
//! [`Connection`] it reports to. The concrete kinds wrap it:
//!
//! - [`BuildJob`]: a commit waiting for the build worker
//! - [`DistributionJob`]: an artifact waiting for a remote host
//! - [`UpdateCiJob`]: a barrier that refreshes every host
//!
//! All progress reaches the client through [`Job::log`] and the job ends with
//! exactly one sentinel frame written by [`Job::succeed`] or [`Job::fail`].

pub mod commit;
pub mod connection;
pub mod distribution;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StageError;

pub use commit::CommitInfo;
pub use connection::{sentinel, Connection, EXIT_FAILURE, EXIT_SUCCESS, SENTINEL_PREFIX};
pub use distribution::{Category, DistributionJob, DistributionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Building,
    Uploading,
    Testing,
    Attacking,
    Success,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Building => 1,
            JobStatus::Uploading => 2,
            JobStatus::Testing | JobStatus::Attacking => 3,
            JobStatus::Success | JobStatus::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Building => write!(f, "BUILDING"),
            JobStatus::Uploading => write!(f, "UPLOADING"),
            JobStatus::Testing => write!(f, "TESTING"),
            JobStatus::Attacking => write!(f, "ATTACKING"),
            JobStatus::Success => write!(f, "SUCCESS"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// What the status reporter sees of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub result: JobStatus,
    pub action_start: i64,
    pub commit: Option<CommitInfo>,
}

#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    status: JobStatus,
    started_at: DateTime<Utc>,
    conn: Connection,
}

impl Job {
    pub fn new(conn: Connection) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            started_at: Utc::now(),
            conn,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn stamp_start(&mut self) {
        self.started_at = Utc::now();
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Give up the job record, keeping the client connection for the next
    /// job of the same request.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Move forward to `next`. Backwards moves and changes after a terminal
    /// state are refused.
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            tracing::warn!(job_id = %self.id, from = %self.status, to = %next, "Refusing status transition");
            return false;
        }
        self.status = next;
        true
    }

    /// Put an in-flight job back to PENDING after its host dropped.
    pub fn requeue(&mut self) {
        debug_assert!(!self.status.is_terminal());
        if !self.status.is_terminal() {
            self.status = JobStatus::Pending;
        }
    }

    pub fn snapshot(&self, commit: Option<&CommitInfo>) -> JobSnapshot {
        JobSnapshot {
            result: self.status,
            action_start: self.started_at.timestamp(),
            commit: commit.cloned(),
        }
    }

    /// Log locally and echo the line to the client. A dead client is noted on
    /// the connection but never reported to the caller.
    pub async fn log(&mut self, message: &str) {
        tracing::info!(job_id = %self.id, "{}", message);
        let _ = self.conn.send_line(message).await;
    }

    /// Forward raw process output to the client, best effort.
    pub async fn forward(&mut self, bytes: &[u8]) {
        let _ = self.conn.send(bytes).await;
    }

    /// Canonical failure path: report, forward captured output, send `%*&1`,
    /// close and mark FAILED.
    pub async fn fail(&mut self, error: &StageError, message: &str) {
        tracing::error!(job_id = %self.id, error = %error, "{}", message);
        let _ = self.conn.send_line(message).await;
        if !error.output.is_empty() {
            let _ = self.conn.send(&error.output).await;
        }
        let trace = diagnostic_trace(error);
        tracing::debug!(job_id = %self.id, trace = %trace, "Failure diagnostic");
        let _ = self.conn.send_line(&trace).await;
        let _ = self.conn.finish(EXIT_FAILURE).await;
        self.status = JobStatus::Failed;
    }

    /// Send `%*&0`, close and mark SUCCESS.
    pub async fn succeed(&mut self) {
        let _ = self.conn.finish(EXIT_SUCCESS).await;
        self.status = JobStatus::Success;
    }

    /// The client went away mid-job; there is nobody left to tell.
    pub async fn abandon(&mut self) {
        tracing::warn!(job_id = %self.id, peer = %self.conn.peer(), "Client disconnected");
        self.conn.close().await;
        self.status = JobStatus::Failed;
    }
}

fn diagnostic_trace(error: &(dyn std::error::Error + 'static)) -> String {
    let mut trace = format!("Error: {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str(&format!("\n  caused by: {cause}"));
        source = cause.source();
    }
    trace
}

/// A commit waiting for (or going through) the build worker.
#[derive(Debug)]
pub struct BuildJob {
    pub job: Job,
    pub commit: CommitInfo,
}

impl BuildJob {
    pub fn new(conn: Connection, commit: CommitInfo) -> Self {
        Self {
            job: Job::new(conn),
            commit,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.snapshot(Some(&self.commit))
    }
}

/// Barrier that refreshes every connected host once all queued work is done.
#[derive(Debug)]
pub struct UpdateCiJob {
    pub job: Job,
}

impl UpdateCiJob {
    pub fn new(conn: Connection) -> Self {
        Self { job: Job::new(conn) }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.job.snapshot(None)
    }
}
