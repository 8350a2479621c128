//! portmux
//!
//! Serves HTTPS and plaintext HTTP on one public port in front of a loopback
//! TLS backend.
//!
//! ## Startup
//!
//! 1. Ensure the self-signed certificate bundle for the environment exists
//! 2. Start the backend (unless `--no-backend`) and wait until it is reachable
//! 3. Bind the public port and accept connections
//!
//! Any failure during startup exits non-zero. After SIGINT or SIGTERM the
//! public port is closed, open connections are given time to finish, and the
//! backend is stopped.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portmux::cert::{ensure_certificate, OpensslTool};
use portmux::config::{Config, LogFormat};
use portmux::mux::{tls, BackendDialer, Listener, TracingReporter};
use portmux::supervisor::BackendSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    info!(
        environment = %config.environment,
        bind_addr = %config.bind_addr,
        backend_addr = %config.backend_addr,
        "Starting portmux"
    );

    // Certificate bundle
    let bundle = ensure_certificate(&config.env_dir, &OpensslTool::new(&config.openssl))
        .context("failed to provision TLS certificate")?;

    // Backend
    let mut backend = match &config.backend {
        Some(command) => BackendSupervisor::spawn(command).context("failed to start backend")?,
        None => BackendSupervisor::external(config.backend_addr),
    };
    backend
        .ready_or_stop(config.backend_ready_timeout)
        .await
        .context("backend did not become ready")?;

    // TLS contexts
    let acceptor = tls::acceptor(&bundle.cert_path, &bundle.key_path)
        .context("failed to load TLS certificate")?;
    let connector = tls::backend_connector().context("failed to build backend TLS client")?;
    let dialer = BackendDialer::new(config.backend_addr, connector);

    // Public listener
    let listener = Listener::bind(
        config.listener_config(),
        acceptor,
        dialer,
        Arc::new(TracingReporter),
    )
    .await
    .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let stats = listener.stats();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listener_handle = tokio::spawn(listener.run(shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut listener_done = false;

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        result = &mut listener_handle => {
            listener_done = true;
            match result {
                Ok(Ok(())) => info!("Listener exited"),
                Ok(Err(e)) => error!(error = %e, "Listener error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    // Stop accepting; the listening socket closes when the task returns.
    let _ = shutdown_tx.send(true);
    if !listener_done {
        match listener_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Listener error"),
            Err(e) => error!(error = %e, "Listener task panicked"),
        }
    }

    info!(
        active = stats.active(),
        drain_timeout_secs = config.drain_timeout.as_secs(),
        "Draining connections"
    );
    if !stats.wait_idle(config.drain_timeout).await {
        warn!(active = stats.active(), "Drain timeout reached, abandoning connections");
    }
    stats.log_summary();

    if let Err(e) = backend.stop().await {
        warn!(error = %e, "Failed to stop backend");
    }

    info!("portmux shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
