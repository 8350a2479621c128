//! Backend process supervision.
//!
//! The backend is a separate program that serves TLS on a loopback port. The
//! supervisor starts it with its output sent to a log file, then polls the
//! port until it accepts connections so the public listener only opens once
//! the backend is reachable. Only the process exit status is observed.

use std::fs::{self, OpenOptions};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Default time allowed for the backend to become reachable.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// First delay between readiness checks.
const READY_BACKOFF_START: Duration = Duration::from_millis(50);

/// Cap on the delay between readiness checks.
const READY_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Errors from backend supervision.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to open backend log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start backend {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("backend exited before becoming ready: {0}")]
    ExitedEarly(ExitStatus),

    #[error("backend at {addr} not reachable after {timeout:?}")]
    NotReady { addr: SocketAddr, timeout: Duration },

    #[error("backend process error: {0}")]
    Io(#[from] io::Error),
}

/// How to launch the backend.
#[derive(Debug, Clone)]
pub struct BackendCommand {
    /// Program to execute.
    pub program: String,
    /// Leading arguments, e.g. the application script.
    pub args: Vec<String>,
    /// Loopback port the backend must serve TLS on.
    pub port: u16,
    /// File receiving the backend's stdout and stderr.
    pub log_path: PathBuf,
}

impl BackendCommand {
    /// Full argument list: the configured arguments followed by the TLS mode
    /// and port flags.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--ssl".to_string());
        args.push("--port".to_string());
        args.push(self.port.to_string());
        args
    }

    /// Address the backend will listen on.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Owns the backend process, if this process started it.
#[derive(Debug)]
pub struct BackendSupervisor {
    addr: SocketAddr,
    child: Option<Child>,
}

impl BackendSupervisor {
    /// Start the backend. The child is killed if the supervisor is dropped.
    pub fn spawn(command: &BackendCommand) -> Result<Self, SupervisorError> {
        let log_err = |source| SupervisorError::Log {
            path: command.log_path.clone(),
            source,
        };

        if let Some(parent) = command.log_path.parent() {
            fs::create_dir_all(parent).map_err(log_err)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&command.log_path)
            .map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let child = Command::new(&command.program)
            .args(command.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        info!(
            program = %command.program,
            pid = child.id(),
            port = command.port,
            log_path = %command.log_path.display(),
            "Backend started"
        );

        Ok(Self {
            addr: command.addr(),
            child: Some(child),
        })
    }

    /// Supervise a backend started by someone else; only readiness is checked.
    pub fn external(addr: SocketAddr) -> Self {
        Self { addr, child: None }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// OS pid of the owned backend, while it runs.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Poll the backend port until a TCP connect succeeds.
    ///
    /// Fails if `ready_timeout` elapses first or the owned backend exits.
    pub async fn wait_until_ready(&mut self, ready_timeout: Duration) -> Result<(), SupervisorError> {
        let started = Instant::now();
        let deadline = started + ready_timeout;
        let mut delay = READY_BACKOFF_START;
        let mut attempts = 0u32;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(SupervisorError::ExitedEarly(status));
                }
            }

            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, TcpStream::connect(self.addr)).await {
                Ok(Ok(_)) => {
                    info!(
                        backend_addr = %self.addr,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Backend ready"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!(backend_addr = %self.addr, attempts, error = %e, "Backend not ready");
                }
                Err(_) => {}
            }

            if Instant::now() + delay >= deadline {
                return Err(SupervisorError::NotReady {
                    addr: self.addr,
                    timeout: ready_timeout,
                });
            }
            sleep(delay).await;
            delay = (delay * 2).min(READY_BACKOFF_MAX);
        }
    }

    /// Like [`wait_until_ready`](Self::wait_until_ready), but stops the owned
    /// backend before returning a readiness failure.
    pub async fn ready_or_stop(&mut self, ready_timeout: Duration) -> Result<(), SupervisorError> {
        let result = self.wait_until_ready(ready_timeout).await;
        if result.is_err() {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Failed to stop backend");
            }
        }
        result
    }

    /// Kill the owned backend and reap it. No-op for external backends.
    pub async fn stop(&mut self) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match child.try_wait()? {
            Some(status) => {
                warn!(status = %status, "Backend already exited");
            }
            None => {
                child.kill().await?;
                info!("Backend stopped");
            }
        }
        Ok(())
    }
}
