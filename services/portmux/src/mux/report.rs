//! Reporting hook for per-connection failures.
//!
//! Connection errors never leave the connection task. Reporting them is
//! delegated to an [`ErrorReporter`] so callers can log, count or drop them
//! without touching the dispatch logic.

use std::net::SocketAddr;

use tracing::{debug, warn};

use super::session::{SessionError, Stage};

/// Receives every error that ends a connection.
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, peer_addr: SocketAddr, error: &SessionError);
}

/// Default reporter that logs through `tracing`.
///
/// Handshake failures and unclassified connections are routine under port
/// scans and log at debug. Backend dial failures log at warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, peer_addr: SocketAddr, error: &SessionError) {
        match error.stage() {
            Stage::BackendDial => warn!(
                peer_addr = %peer_addr,
                stage = %error.stage(),
                error = %error,
                "Backend unavailable"
            ),
            stage => debug!(
                peer_addr = %peer_addr,
                stage = %stage,
                error = %error,
                "Connection error"
            ),
        }
    }
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ErrorReporter for NullReporter {
    fn report(&self, _peer_addr: SocketAddr, _error: &SessionError) {}
}
