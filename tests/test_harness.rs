//! Shared fakes and helpers for the integration tests.
//!
//! [`FakeTransport`] stands in for ssh/rsync and [`FakeToolchain`] for the
//! local build, so whole pipelines run in-process against duplex streams or
//! a loopback listener.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hwci::builder::Toolchain;
use hwci::config::CiConfig;
use hwci::error::{StageError, StageKind, TransportError};
use hwci::job::{Category, CommitInfo, Connection, Job};
use hwci::node::Node;
use hwci::process::ProcessOutput;
use hwci::remote::HostTransport;
use hwci::scheduler::Context;
use hwci::status::LogReporter;

pub const TOKEN: &str = "s3cret";

/// Config with short timeouts and the given rigs.
pub fn test_config(test_hosts: &[&str], attack_hosts: &[&str]) -> CiConfig {
    let mut config = CiConfig::new("127.0.0.1:0".parse().unwrap(), TOKEN);
    for host in test_hosts {
        config = config.with_host(Category::Test, *host);
    }
    for host in attack_hosts {
        config = config.with_host(Category::Attack, *host);
    }
    config.read_timeout = Duration::from_secs(2);
    config.distribution.flash_timeout = Duration::from_secs(5);
    config.distribution.run_timeout = Duration::from_secs(5);
    config.distribution.update_timeout = Duration::from_secs(5);
    config
}

pub fn test_context(config: CiConfig) -> Arc<Context> {
    let (ctx, _reports) = Context::new(config);
    Arc::new(ctx)
}

/// A connection whose client end is returned for reading.
pub fn duplex_conn() -> (Connection, DuplexStream) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (Connection::new("duplex", server), client)
}

pub fn commit(hash: &str, run_id: &str) -> CommitInfo {
    CommitInfo::new(hash, "alice", "test commit", run_id).unwrap()
}

/// Read until the server closes, failing the test after 10 s.
pub async fn read_to_close<R>(mut reader: R) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut out))
        .await
        .expect("server never closed the connection")
        .expect("read failed");
    String::from_utf8_lossy(&out).into_owned()
}

/// Poll `condition` every 10 ms for up to 5 s.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("operation timed out")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub host: String,
    pub sources: Vec<PathBuf>,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exec {
    pub host: String,
    pub command: String,
}

/// Records every remote operation and fails on demand.
#[derive(Default)]
pub struct FakeTransport {
    uploads: Mutex<Vec<Upload>>,
    execs: Mutex<Vec<Exec>>,
    disconnected: Mutex<HashSet<String>>,
    disconnected_at: Mutex<Vec<(String, String)>>,
    broken_pipes: Mutex<HashMap<String, u32>>,
    failing: Mutex<Option<String>>,
    run_output: Mutex<Vec<u8>>,
    run_delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Uploads to `host` fail with the disconnect signature.
    pub fn disconnect(&self, host: &str) {
        self.disconnected.lock().unwrap().insert(host.to_string());
    }

    /// Only uploads to `host` whose destination contains `dest` fail with the
    /// disconnect signature.
    pub fn disconnect_at(&self, host: &str, dest: &str) {
        self.disconnected_at
            .lock()
            .unwrap()
            .push((host.to_string(), dest.to_string()));
    }

    /// The next `times` uploads to `host` hit a broken pipe.
    pub fn break_pipe(&self, host: &str, times: u32) {
        self.broken_pipes
            .lock()
            .unwrap()
            .insert(host.to_string(), times);
    }

    /// Remote commands containing `needle` exit non-zero.
    pub fn fail_commands_containing(&self, needle: &str) {
        *self.failing.lock().unwrap() = Some(needle.to_string());
    }

    /// What streamed commands print.
    pub fn set_run_output(&self, output: &str) {
        *self.run_output.lock().unwrap() = output.as_bytes().to_vec();
    }

    /// How long streamed commands take.
    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = delay;
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn execs(&self) -> Vec<Exec> {
        self.execs.lock().unwrap().clone()
    }

    pub fn uploads_to(&self, host: &str) -> usize {
        self.uploads().iter().filter(|u| u.host == host).count()
    }

    fn check_failure(&self, command: &str, kind: StageKind) -> Result<(), StageError> {
        match self.failing.lock().unwrap().as_deref() {
            Some(needle) if command.contains(needle) => Err(StageError::new(
                kind,
                "exit code Some(1)",
            )
            .with_output(b"remote command failed\n".to_vec())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl HostTransport for FakeTransport {
    async fn upload(
        &self,
        host: &str,
        sources: &[PathBuf],
        dest: &str,
    ) -> Result<(), TransportError> {
        self.uploads.lock().unwrap().push(Upload {
            host: host.to_string(),
            sources: sources.to_vec(),
            dest: dest.to_string(),
        });

        let lost_here = self
            .disconnected_at
            .lock()
            .unwrap()
            .iter()
            .any(|(h, d)| h == host && dest.contains(d.as_str()));
        if lost_here || self.disconnected.lock().unwrap().contains(host) {
            return Err(TransportError::Disconnected {
                host: host.to_string(),
                output: b"Connection closed by 10.0.0.7 port 22\n".to_vec(),
            });
        }
        let mut pipes = self.broken_pipes.lock().unwrap();
        if let Some(remaining) = pipes.get_mut(host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::BrokenPipe {
                    host: host.to_string(),
                    output: b"rsync: write error: Broken pipe (32)\n".to_vec(),
                });
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        host: &str,
        command: &str,
        kind: StageKind,
        _timeout: Duration,
    ) -> Result<ProcessOutput, StageError> {
        self.execs.lock().unwrap().push(Exec {
            host: host.to_string(),
            command: command.to_string(),
        });
        self.check_failure(command, kind)?;
        Ok(ProcessOutput {
            exit_code: Some(0),
            stdout: b"flashed\n".to_vec(),
            stderr: Vec::new(),
        })
    }

    async fn exec_streaming(
        &self,
        host: &str,
        command: &str,
        kind: StageKind,
        _timeout: Duration,
        job: &mut Job,
    ) -> Result<Vec<u8>, StageError> {
        self.execs.lock().unwrap().push(Exec {
            host: host.to_string(),
            command: command.to_string(),
        });
        let delay = *self.run_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.check_failure(command, kind)?;
        let output = self.run_output.lock().unwrap().clone();
        job.forward(&output).await;
        Ok(output)
    }
}

/// Builds instantly (or after a delay) into a scratch folder.
pub struct FakeToolchain {
    root: TempDir,
    delay: Duration,
    fail_stage: Option<(StageKind, String)>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    builds: AtomicUsize,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            delay: Duration::ZERO,
            fail_stage: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every firmware build hits the build timeout.
    pub fn timing_out(mut self) -> Self {
        let timeout = StageError::timed_out(StageKind::Build, Duration::from_secs(600));
        self.fail_stage = Some((timeout.kind, timeout.detail));
        self
    }

    /// The `kind` stage exits non-zero.
    pub fn failing_at(mut self, kind: StageKind) -> Self {
        self.fail_stage = Some((kind, "exit code Some(1)".to_string()));
        self
    }

    fn check_stage(&self, kind: StageKind, output: &[u8]) -> Result<(), StageError> {
        match &self.fail_stage {
            Some((failing, detail)) if *failing == kind => {
                Err(StageError::new(kind, detail.clone()).with_output(output.to_vec()))
            }
            _ => Ok(()),
        }
    }

    pub fn builds_root(&self) -> &Path {
        self.root.path()
    }

    /// Highest number of builds seen running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn sync_repo(&self, commit: &CommitInfo) -> Result<Vec<u8>, StageError> {
        self.check_stage(
            StageKind::RepoSync,
            format!("fatal: reference is not a tree: {}\n", commit.hash).as_bytes(),
        )?;
        Ok(format!("HEAD is now at {}\n", commit.short_hash()).into_bytes())
    }

    async fn generate_secrets(&self) -> Result<Vec<u8>, StageError> {
        self.check_stage(StageKind::Secrets, b"ModuleNotFoundError: ectf25_design\n")?;
        Ok(Vec::new())
    }

    async fn build_firmware(&self) -> Result<Vec<u8>, StageError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.builds.fetch_add(1, Ordering::SeqCst);

        self.check_stage(StageKind::Build, b"make: *** waiting for unfinished jobs\n")?;
        Ok(b"build ok\n".to_vec())
    }

    async fn stage_artifact(&self, commit: &CommitInfo) -> Result<PathBuf, StageError> {
        let dir = self.root.path().join(&commit.run_id);
        let out = dir.join("build_out");
        tokio::fs::create_dir_all(&out)
            .await
            .map_err(|e| StageError::new(StageKind::Staging, e.to_string()))?;
        tokio::fs::write(out.join("max78000.bin"), commit.hash.as_bytes())
            .await
            .map_err(|e| StageError::new(StageKind::Staging, e.to_string()))?;
        Ok(dir)
    }
}

/// A full server on a loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub ctx: Arc<Context>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(
        config: CiConfig,
        transport: Arc<FakeTransport>,
        toolchain: Arc<FakeToolchain>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Node::with_parts(config, transport, toolchain, Arc::new(LogReporter));
        let ctx = node.context();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            node.run_with_listener(listener, token).await.unwrap();
        });
        Self {
            addr,
            ctx,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = within(self.handle).await;
    }

    /// Send a request the way the CI client does: command frame, wait for
    /// the ack line, then the payload. Returns everything received.
    pub async fn request(&self, token: &str, command: &str, payload: Option<&str>) -> String {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(format!("{token}|{command}").as_bytes())
            .await
            .unwrap();

        let mut ack = String::new();
        within(reader.read_line(&mut ack)).await.unwrap();
        if ack.is_empty() {
            return ack;
        }
        if let Some(payload) = payload {
            writer.write_all(payload.as_bytes()).await.unwrap();
        }
        ack + &read_to_close(reader).await
    }
}
