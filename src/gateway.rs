use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{CiError, Result, ValidationError};
use crate::job::distribution::{parse_script_url, script_file_name, team_dir};
use crate::job::{BuildJob, CommitInfo, Connection, DistributionJob, JobSnapshot, UpdateCiJob};
use crate::protocol::{self, Command};
use crate::remote::HostTransport;
use crate::scheduler::{run_update_ci, Context};
use crate::status::UpdateType;

/// Accepts client connections and turns requests into queued jobs.
#[derive(Clone)]
pub struct Gateway {
    ctx: Arc<Context>,
    transport: Arc<dyn HostTransport>,
}

impl Gateway {
    pub fn new(ctx: Arc<Context>, transport: Arc<dyn HostTransport>) -> Self {
        Self { ctx, transport }
    }

    /// Accept until `shutdown` fires. Each client is handled on its own task;
    /// a failing client never stops the loop.
    pub async fn run(self, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => tracing::info!(addr = %addr, "Listening for CI requests"),
            Err(e) => tracing::warn!(error = %e, "Listener has no local address"),
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let gateway = self.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = gateway.handle(peer.to_string(), reader, writer).await {
                    tracing::warn!(peer = %peer, error = %e, "Request failed");
                }
            });
        }
        tracing::info!("Gateway stopped");
    }

    /// Serve one request. Rejected requests close the connection here;
    /// accepted ones hand it to a job.
    pub async fn handle<R, W>(&self, peer: String, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let read_timeout = self.ctx.config().read_timeout;
        let mut conn = Connection::new(peer, writer);

        let frame = protocol::read_frame(&mut reader, read_timeout).await?;
        let (token, name) = match protocol::parse_request(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        };
        if !protocol::verify_token(&self.ctx.config().auth_token, token) {
            // unauthenticated clients get nothing back
            tracing::warn!(peer = %conn.peer(), "Rejected request with bad token");
            conn.close().await;
            return Err(CiError::Unauthorized);
        }
        let command = match name.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(peer = %conn.peer(), command = %name, "Unknown command");
                let _ = conn.send_line(&format!("[CONN] Unknown command {name}")).await;
                conn.close().await;
                return Err(e);
            }
        };

        tracing::info!(peer = %conn.peer(), command = ?command, "Request accepted");
        conn.send_line(command.ack()).await?;

        if command == Command::UpdateCi {
            let job = UpdateCiJob::new(conn);
            run_update_ci(self.ctx.clone(), self.transport.clone(), job).await;
            return Ok(());
        }

        let payload = match protocol::read_frame(&mut reader, read_timeout).await {
            Ok(payload) => payload,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        self.submit(command, &payload, conn).await
    }

    async fn submit(&self, command: Command, payload: &str, conn: Connection) -> Result<()> {
        let distribution = &self.ctx.config().distribution;
        let targets = distribution.targets_dir.as_path();
        let image = distribution.firmware_image.as_str();

        let snapshot = match command {
            Command::BuildOurs => match CommitInfo::parse_frame(payload) {
                Ok(commit) => {
                    let build = BuildJob::new(conn, commit);
                    let snapshot = build.snapshot();
                    self.ctx.builds().push(build);
                    snapshot
                }
                Err(e) => return reject(conn, e).await,
            },
            Command::AttackTarget => {
                let team = payload.trim();
                if let Err(e) = team_dir(team, targets) {
                    return reject(conn, e).await;
                }
                self.enqueue(DistributionJob::attacking(conn, team, targets, image)?)
            }
            Command::AttackScript => {
                let (team, url) = match check_attack_script(payload, targets) {
                    Ok(parts) => parts,
                    Err(e) => return reject(conn, e).await,
                };
                self.enqueue(DistributionJob::attack_script(conn, team, url, targets, image)?)
            }
            Command::UpdateCi => return Err(CiError::UnknownCommand("update-ci".to_string())),
        };

        self.ctx.report(UpdateType::Queue, Some(snapshot));
        Ok(())
    }

    fn enqueue(&self, job: DistributionJob) -> JobSnapshot {
        let snapshot = job.snapshot();
        self.ctx.queue(job.category).push(job);
        snapshot
    }
}

/// Tell the client what was wrong with its payload and hang up.
async fn reject(mut conn: Connection, error: ValidationError) -> Result<()> {
    let _ = conn.send_line(&format!("[CONN] {error}")).await;
    conn.close().await;
    Err(error.into())
}

fn check_attack_script<'a>(
    payload: &'a str,
    targets: &Path,
) -> std::result::Result<(&'a str, &'a str), ValidationError> {
    let (team, url) = protocol::parse_attack_script(payload)?;
    let (team, url) = (team.trim(), url.trim());
    team_dir(team, targets)?;
    script_file_name(&parse_script_url(url)?)?;
    Ok((team, url))
}
