//! Public listener and per-connection dispatch.
//!
//! The listener accepts connections, sniffs each one and hands it to either
//! the redirector or the TLS terminator. Every connection runs in its own
//! task; whatever happens inside that task is reported and dropped there.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::redirect::Redirector;
use super::report::ErrorReporter;
use super::session::{BackendDialer, ProxySession, SessionError, TlsTerminator, DEFAULT_IO_TIMEOUT};
use super::sniff::{Protocol, Sniffer, DEFAULT_SNIFF_TIMEOUT};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default accept backlog.
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Default fallback host for redirects without a usable Host header.
pub const DEFAULT_REDIRECT_HOST: &str = "localhost";

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Port advertised in redirects. Defaults to the bound port.
    pub public_port: Option<u16>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Accept backlog.
    pub backlog: u32,
    /// Classification timeout.
    pub sniff_timeout: Duration,
    /// Backend dial and per read/write proxy timeout.
    pub io_timeout: Duration,
    /// Fallback host for redirects.
    pub redirect_host: String,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            public_port: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backlog: DEFAULT_BACKLOG,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            redirect_host: DEFAULT_REDIRECT_HOST.to_string(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections classified as TLS.
    pub classified_tls: AtomicU64,
    /// Connections classified as plaintext HTTP.
    pub classified_http: AtomicU64,
    /// Connections dropped without a classification.
    pub classified_unknown: AtomicU64,
    /// Redirect responses written.
    pub redirects_sent: AtomicU64,
    /// Client TLS handshakes that failed or timed out.
    pub handshakes_failed: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    /// Connections currently being handled.
    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Wait until no connection is active, or `grace` elapses.
    ///
    /// Returns `true` if every connection finished in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.active() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Emit a summary of all counters.
    pub fn log_summary(&self) {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        info!(
            connections_accepted = get(&self.connections_accepted),
            connections_closed = get(&self.connections_closed),
            connections_rejected = get(&self.connections_rejected),
            classified_tls = get(&self.classified_tls),
            classified_http = get(&self.classified_http),
            classified_unknown = get(&self.classified_unknown),
            redirects_sent = get(&self.redirects_sent),
            handshakes_failed = get(&self.handshakes_failed),
            backend_connected = get(&self.backend_connected),
            backend_failed = get(&self.backend_failed),
            bytes_to_backend = get(&self.bytes_to_backend),
            bytes_from_backend = get(&self.bytes_from_backend),
            "Listener statistics"
        );
    }
}

/// Keeps a connection counted as active; releases its slot on drop, panics
/// included.
struct ActiveConnection {
    stats: Arc<ListenerStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared, read-only state used by every connection task.
struct Dispatcher {
    sniffer: Sniffer,
    redirector: Redirector,
    terminator: TlsTerminator,
    dialer: BackendDialer,
    io_timeout: Duration,
    stats: Arc<ListenerStats>,
    reporter: Arc<dyn ErrorReporter>,
}

impl Dispatcher {
    async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.dispatch(stream).await {
            self.reporter.report(peer_addr, &e);
        }
    }

    async fn dispatch(&self, mut stream: TcpStream) -> Result<(), SessionError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let protocol = self.sniffer.classify(&stream).await;
        debug!(protocol = %protocol, "Connection classified");

        match protocol {
            Protocol::Unknown => {
                self.stats.classified_unknown.fetch_add(1, Ordering::Relaxed);
                Err(SessionError::Unclassified(protocol))
            }
            Protocol::Http => {
                self.stats.classified_http.fetch_add(1, Ordering::Relaxed);
                self.redirector
                    .respond(&mut stream)
                    .await
                    .map_err(SessionError::Redirect)?;
                self.stats.redirects_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Protocol::Tls => {
                self.stats.classified_tls.fetch_add(1, Ordering::Relaxed);
                self.proxy(stream).await
            }
        }
    }

    async fn proxy(&self, stream: TcpStream) -> Result<(), SessionError> {
        let mut client = match self.terminator.handshake(stream).await {
            Ok(client) => client,
            Err(e) => {
                self.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        debug!("TLS handshake complete");

        let backend = match self.dialer.dial().await {
            Ok(backend) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                backend
            }
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                // No error page: just close the client leg cleanly.
                let _ = timeout(self.io_timeout, client.shutdown()).await;
                return Err(e);
            }
        };
        debug!(backend_addr = %self.dialer.addr(), "Connected to backend");

        let bytes = ProxySession::new(client, backend, self.io_timeout)
            .run()
            .await?;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes.to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes.from_backend, Ordering::Relaxed);

        debug!(
            bytes_to_backend = bytes.to_backend,
            bytes_from_backend = bytes.from_backend,
            "Session closed"
        );
        Ok(())
    }
}

/// The public multiplexing listener.
pub struct Listener {
    /// The TCP listener. Closed when `run` returns.
    listener: TcpListener,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// State shared with connection tasks.
    dispatcher: Arc<Dispatcher>,
}

impl Listener {
    /// Bind the public port.
    pub async fn bind(
        config: ListenerConfig,
        acceptor: TlsAcceptor,
        dialer: BackendDialer,
        reporter: Arc<dyn ErrorReporter>,
    ) -> io::Result<Self> {
        let listener = bind_socket(config.bind_addr, config.backlog)?;
        let local_addr = listener.local_addr()?;
        let public_port = config.public_port.unwrap_or(local_addr.port());

        info!(
            bind_addr = %local_addr,
            public_port,
            backend_addr = %dialer.addr(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        let dispatcher = Dispatcher {
            sniffer: Sniffer::new(config.sniff_timeout),
            redirector: Redirector::new(public_port, config.redirect_host),
            terminator: TlsTerminator::new(acceptor, config.io_timeout),
            dialer: dialer.with_timeout(config.io_timeout),
            io_timeout: config.io_timeout,
            stats: Arc::new(ListenerStats::default()),
            reporter,
        };

        Ok(Self {
            listener,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics. Remains valid after `run` returns.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.dispatcher.stats)
    }

    /// Accept connections until `shutdown` flips or its sender is dropped.
    ///
    /// The listening socket is closed on return; connection tasks already
    /// spawned keep running to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        let stats = self.stats();
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = shutdown.changed() => {
                    info!(bind_addr = %local_addr, "Listener stopping");
                    break;
                }
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    stats.connections_active.fetch_add(1, Ordering::Relaxed);
                    let active = ActiveConnection {
                        stats: Arc::clone(&stats),
                        _permit: permit,
                    };

                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(
                        async move {
                            dispatcher.handle(stream, peer_addr).await;
                            drop(active);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }

        Ok(())
    }
}

/// Bind with `SO_REUSEADDR` and an explicit backlog.
fn bind_socket(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
