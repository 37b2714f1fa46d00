//! Control socket
//!
//! One JSON request per connection: the client writes the request and shuts
//! down its write half, the daemon answers with one JSON response.
//!
//! Requests: `{"type": "status"}`, `{"type": "reset"}`, `{"type": "stop"}`

use crate::engine::{Command, StatusHandle, StatusSnapshot};
use crate::evaluator::TrustLevel;
use anyhow::{bail, Context, Result};
use onionguard_core::paths::ensure_parent;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Requests larger than this are rejected
const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Long enough for a reset whose network restore has to time out
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Status,
    Reset,
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
}

impl Response {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket, replacing a stale one; owner-only permissions
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                bail!("another daemon is listening on {}", path.display());
            }
            std::fs::remove_file(path).with_context(|| format!("Failed to remove stale socket {:?}", path))?;
        }
        ensure_parent(path)?;

        let listener = UnixListener::bind(path).with_context(|| format!("Failed to bind {:?}", path))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        info!("control socket listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self, status: StatusHandle, commands: mpsc::Sender<Command>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let status = status.clone();
                    let commands = commands.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, status, commands).await {
                            debug!("control connection failed: {:#}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("control socket accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    status: StatusHandle,
    commands: mpsc::Sender<Command>,
) -> Result<()> {
    let mut bytes = Vec::new();
    (&mut stream).take(MAX_REQUEST_BYTES).read_to_end(&mut bytes).await?;

    let response = match serde_json::from_slice::<Request>(&bytes) {
        Ok(request) => {
            debug!("control request: {:?}", request);
            dispatch(request, &status, &commands).await
        }
        Err(e) => Response::error(format!("invalid request: {}", e)),
    };

    stream.write_all(&serde_json::to_vec(&response)?).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn dispatch(request: Request, status: &StatusHandle, commands: &mpsc::Sender<Command>) -> Response {
    match request {
        Request::Status => Response {
            status: Some(status.snapshot()),
            trust_level: Some(status.trust_level()),
            ..Response::ok()
        },
        Request::Reset => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if commands.send(Command::Reset(reply_tx)).await.is_err() {
                return Response::error("engine is not running");
            }
            match reply_rx.await {
                Ok(Ok(level)) => Response {
                    trust_level: Some(level),
                    ..Response::ok()
                },
                Ok(Err(e)) => Response {
                    trust_level: Some(status.trust_level()),
                    ..Response::error(e.to_string())
                },
                Err(_) => Response::error("engine stopped before answering"),
            }
        }
        Request::Stop => {
            if commands.send(Command::Stop).await.is_err() {
                return Response::error("engine is not running");
            }
            Response::ok()
        }
    }
}

/// Client side of the control socket
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn send(&self, request: &Request) -> Result<Response> {
        tokio::time::timeout(CLIENT_TIMEOUT, self.exchange(request))
            .await
            .context("Daemon did not answer in time")?
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("Failed to connect to daemon at {:?}", self.socket_path))?;

        stream.write_all(&serde_json::to_vec(request)?).await?;
        stream.shutdown().await?;

        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await?;
        serde_json::from_slice(&bytes).context("Failed to parse daemon response")
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let response = self.send(&Request::Status).await?;
        match response.status {
            Some(status) if response.success => Ok(status),
            _ => bail!(response.error.unwrap_or_else(|| "daemon returned no status".to_string())),
        }
    }

    /// The error carries the daemon's refusal reason
    pub async fn reset(&self) -> Result<TrustLevel> {
        let response = self.send(&Request::Reset).await?;
        match response.trust_level {
            Some(level) if response.success => Ok(level),
            _ => bail!(response.error.unwrap_or_else(|| "reset failed".to_string())),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let response = self.send(&Request::Stop).await?;
        if !response.success {
            bail!(response.error.unwrap_or_else(|| "stop failed".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CutoffConfig, ProbeSettings};
    use crate::cutoff::DryRunCutoff;
    use crate::engine::Guard;
    use crate::killswitch::KillSwitch;
    use crate::probe::{ProbeKind, ProbeResult, Severity};
    use crate::report::TracingReporter;
    use std::sync::Arc;

    struct Harness {
        client: ControlClient,
        results: mpsc::Sender<ProbeResult>,
        engine: tokio::task::JoinHandle<crate::error::GuardResult<()>>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("onionguard.sock");

        let reporter = Arc::new(TracingReporter);
        let killswitch = KillSwitch::new(Box::new(DryRunCutoff), &CutoffConfig::default(), reporter.clone());
        let guard = Guard::new(&ProbeSettings::default(), killswitch, reporter);
        let status = guard.status_handle();

        let (results, result_rx) = mpsc::channel(8);
        let (commands, command_rx) = mpsc::channel(8);
        let engine = tokio::spawn(guard.run(result_rx, command_rx));

        let server = ControlServer::bind(&path).unwrap();
        tokio::spawn(server.serve(status, commands));

        Harness {
            client: ControlClient::new(path),
            results,
            engine,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_status_over_socket() {
        let h = harness().await;
        let status = h.client.status().await.unwrap();
        assert_eq!(status.evaluator.trust_level, TrustLevel::Trusted);
        assert!(!status.kill_switch.engaged);
    }

    #[tokio::test]
    async fn test_reset_refused_then_granted() {
        let h = harness().await;
        h.results
            .send(ProbeResult::fail(ProbeKind::DnsLeak, Severity::Critical, "8.8.8.8"))
            .await
            .unwrap();

        // Results and commands share one engine; poll until the result landed
        loop {
            let status = h.client.status().await.unwrap();
            if status.evaluator.trust_level == TrustLevel::Compromised {
                assert!(status.kill_switch.engaged);
                break;
            }
            tokio::task::yield_now().await;
        }

        let err = h.client.reset().await.unwrap_err();
        assert!(err.to_string().contains("full passing round"));

        for kind in ProbeKind::ALL {
            h.results.send(ProbeResult::pass(kind, "")).await.unwrap();
        }
        loop {
            if h.client.status().await.unwrap().evaluator.round_complete() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(h.client.reset().await.unwrap(), TrustLevel::Trusted);
        assert!(!h.client.status().await.unwrap().kill_switch.engaged);
    }

    #[tokio::test]
    async fn test_stop_ends_the_engine() {
        let h = harness().await;
        h.client.stop().await.unwrap();
        h.engine.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_an_error() {
        let h = harness().await;
        let mut stream = UnixStream::connect(&h.client.socket_path).await.unwrap();
        stream.write_all(b"{\"type\":\"explode\"}").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();

        let response: Response = serde_json::from_slice(&bytes).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("invalid request"));
    }

    #[tokio::test]
    async fn test_second_server_on_live_socket_is_refused() {
        let h = harness().await;
        assert!(ControlServer::bind(&h.client.socket_path).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let client = ControlClient::new(dir.path().join("absent.sock"));
        let err = client.status().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to connect"));
    }
}
