//! TLS termination and backend proxying.
//!
//! A TLS connection moves through these phases:
//!
//! ```text
//! Handshaking -> ConnectingBackend -> Proxying -> Terminal
//!      |                |                 |
//!      +----------------+-----------------+--> Terminal (on error)
//! ```
//!
//! Every phase is one-shot. A failed handshake or dial ends the session and
//! the client has to reconnect.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::debug;

use super::sniff::Protocol;

/// Size of each forwarding read.
pub const PROXY_CHUNK: usize = 4096;

/// Default timeout for backend dials and each proxy read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Name presented to the backend in its ClientHello.
pub const BACKEND_SERVER_NAME: &str = "localhost";

/// Phase of a connection in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classify,
    Redirect,
    Handshake,
    BackendDial,
    Proxy,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Classify => "classify",
            Stage::Redirect => "redirect",
            Stage::Handshake => "handshake",
            Stage::BackendDial => "backend_dial",
            Stage::Proxy => "proxy",
        })
    }
}

/// Forwarding direction within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::ClientToBackend => "client_to_backend",
            Direction::BackendToClient => "backend_to_client",
        })
    }
}

/// Per-connection failure. Contained at the connection boundary.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Classification gave up without data.
    #[error("connection classified as {0}")]
    Unclassified(Protocol),

    /// Writing the redirect failed.
    #[error("redirect failed: {0}")]
    Redirect(#[source] io::Error),

    /// Client TLS handshake failed.
    #[error("tls handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// Client TLS handshake did not finish in time.
    #[error("tls handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Backend refused or broke the connection.
    #[error("backend {addr} unreachable: {source}")]
    BackendDial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Backend dial did not finish in time.
    #[error("backend {addr} dial timed out after {timeout:?}")]
    BackendTimeout { addr: SocketAddr, timeout: Duration },

    /// A forwarding loop failed.
    #[error("proxy {direction} failed: {source}")]
    Proxy {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Phase that produced this error.
    pub fn stage(&self) -> Stage {
        match self {
            SessionError::Unclassified(_) => Stage::Classify,
            SessionError::Redirect(_) => Stage::Redirect,
            SessionError::Handshake(_) | SessionError::HandshakeTimeout(_) => Stage::Handshake,
            SessionError::BackendDial { .. } | SessionError::BackendTimeout { .. } => {
                Stage::BackendDial
            }
            SessionError::Proxy { .. } => Stage::Proxy,
        }
    }
}

/// Terminates client TLS with the provisioned certificate.
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsTerminator {
    pub fn new(acceptor: TlsAcceptor, handshake_timeout: Duration) -> Self {
        Self {
            acceptor,
            handshake_timeout,
        }
    }

    /// Complete the server-side handshake on a raw client socket.
    pub async fn handshake(
        &self,
        stream: TcpStream,
    ) -> Result<server::TlsStream<TcpStream>, SessionError> {
        match timeout(self.handshake_timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(SessionError::Handshake(e)),
            Err(_) => Err(SessionError::HandshakeTimeout(self.handshake_timeout)),
        }
    }
}

/// Dials the loopback backend over TLS.
#[derive(Clone)]
pub struct BackendDialer {
    addr: SocketAddr,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
}

impl BackendDialer {
    pub fn new(addr: SocketAddr, connector: TlsConnector) -> Self {
        Self {
            addr,
            connector,
            server_name: ServerName::try_from(BACKEND_SERVER_NAME)
                .unwrap_or_else(|_| ServerName::IpAddress(addr.ip().into())),
            timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Override the dial timeout (TCP connect plus TLS handshake).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open a TLS connection to the backend.
    pub async fn dial(&self) -> Result<client::TlsStream<TcpStream>, SessionError> {
        let connect = async {
            let tcp = TcpStream::connect(self.addr).await?;
            tcp.set_nodelay(true)?;
            self.connector
                .connect(self.server_name.clone(), tcp)
                .await
        };

        match timeout(self.timeout, connect).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(source)) => Err(SessionError::BackendDial {
                addr: self.addr,
                source,
            }),
            Err(_) => Err(SessionError::BackendTimeout {
                addr: self.addr,
                timeout: self.timeout,
            }),
        }
    }
}

/// Bytes moved by a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionBytes {
    pub to_backend: u64,
    pub from_backend: u64,
}

/// Paired client and backend legs of one TLS connection.
///
/// Owns both streams; they are closed when `run` returns.
pub struct ProxySession<C, B> {
    client: C,
    backend: B,
    io_timeout: Duration,
}

impl<C, B> ProxySession<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: C, backend: B, io_timeout: Duration) -> Self {
        Self {
            client,
            backend,
            io_timeout,
        }
    }

    /// Relay bytes both ways until both sides have closed or either fails.
    pub async fn run(self) -> Result<SessionBytes, SessionError> {
        let io_timeout = self.io_timeout;
        let (mut client_read, mut client_write) = tokio::io::split(self.client);
        let (mut backend_read, mut backend_write) = tokio::io::split(self.backend);

        let upstream = async {
            forward(&mut client_read, &mut backend_write, io_timeout)
                .await
                .map_err(|source| SessionError::Proxy {
                    direction: Direction::ClientToBackend,
                    source,
                })
        };
        let downstream = async {
            forward(&mut backend_read, &mut client_write, io_timeout)
                .await
                .map_err(|source| SessionError::Proxy {
                    direction: Direction::BackendToClient,
                    source,
                })
        };

        // First error drops the other direction; both legs close on return.
        let (to_backend, from_backend) = tokio::try_join!(upstream, downstream)?;

        Ok(SessionBytes {
            to_backend,
            from_backend,
        })
    }
}

/// Copy `reader` into `writer` in fixed chunks, then half-close `writer`.
async fn forward<R, W>(reader: &mut R, writer: &mut W, io_timeout: Duration) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PROXY_CHUNK];
    let mut total = 0u64;

    loop {
        let read = timeout(io_timeout, reader.read(&mut buf))
            .await
            .map_err(|_| timed_out("read"))?;
        let n = match read {
            Ok(n) => n,
            // TCP FIN without close_notify: the peer half-closed.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }

        timeout(io_timeout, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| timed_out("write"))??;
        total += n as u64;
    }

    timeout(io_timeout, writer.shutdown())
        .await
        .map_err(|_| timed_out("shutdown"))??;

    debug!(bytes = total, "Forwarding finished");
    Ok(total)
}

fn timed_out(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("proxy {} timed out", op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn error_stages() {
        let io_err = || io::Error::from(io::ErrorKind::ConnectionReset);
        let addr: SocketAddr = "127.0.0.1:8086".parse().unwrap();

        assert_eq!(SessionError::Handshake(io_err()).stage(), Stage::Handshake);
        assert_eq!(
            SessionError::HandshakeTimeout(DEFAULT_IO_TIMEOUT).stage(),
            Stage::Handshake
        );
        assert_eq!(
            SessionError::BackendDial {
                addr,
                source: io_err()
            }
            .stage(),
            Stage::BackendDial
        );
        assert_eq!(
            SessionError::BackendTimeout {
                addr,
                timeout: DEFAULT_IO_TIMEOUT
            }
            .stage(),
            Stage::BackendDial
        );
        assert_eq!(
            SessionError::Proxy {
                direction: Direction::BackendToClient,
                source: io_err()
            }
            .stage(),
            Stage::Proxy
        );
        assert_eq!(SessionError::Redirect(io_err()).stage(), Stage::Redirect);
        assert_eq!(
            SessionError::Unclassified(Protocol::Unknown).stage(),
            Stage::Classify
        );
    }

    #[tokio::test]
    async fn relays_both_directions_and_half_closes() {
        let (client_outer, client_inner) = duplex(64 * 1024);
        let (backend_inner, backend_outer) = duplex(64 * 1024);

        let session = tokio::spawn(
            ProxySession::new(client_inner, backend_inner, Duration::from_secs(5)).run(),
        );

        let (mut client_read, mut client_write) = tokio::io::split(client_outer);
        let (mut backend_read, mut backend_write) = tokio::io::split(backend_outer);

        let upload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        client_write.write_all(&upload).await.unwrap();
        client_write.shutdown().await.unwrap();

        // Backend sees the upload followed by EOF even though it has not
        // answered yet.
        let mut received = Vec::new();
        backend_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, upload);

        backend_write.write_all(b"response").await.unwrap();
        backend_write.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let bytes = session.await.unwrap().unwrap();
        assert_eq!(
            bytes,
            SessionBytes {
                to_backend: upload.len() as u64,
                from_backend: 8
            }
        );
    }

    #[tokio::test]
    async fn idle_read_times_out() {
        let (_client_outer, client_inner) = duplex(1024);
        let (backend_inner, _backend_outer) = duplex(1024);

        let result = ProxySession::new(client_inner, backend_inner, Duration::from_millis(50))
            .run()
            .await;

        match result {
            Err(SessionError::Proxy { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected proxy timeout, got {:?}", other),
        }
    }

    /// Yields its data once, then fails like a TLS stream whose peer sent a
    /// FIN without close_notify.
    struct AbruptEof {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for AbruptEof {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    std::task::Poll::Ready(Ok(()))
                }
                None => std::task::Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into())),
            }
        }
    }

    #[tokio::test]
    async fn unexpected_eof_is_a_half_close() {
        let mut reader = AbruptEof {
            data: Some(b"request".to_vec()),
        };
        let (mut writer, mut peer) = duplex(1024);

        let n = forward(&mut reader, &mut writer, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(n, 7);

        // The destination was shut down, so the peer reads to EOF.
        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");
    }

    #[tokio::test]
    async fn stalled_backend_dial_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts and holds connections without ever answering the ClientHello.
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let connector = crate::mux::tls::backend_connector().unwrap();
        let dialer = BackendDialer::new(addr, connector).with_timeout(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        let err = dialer.dial().await.unwrap_err();
        assert!(matches!(err, SessionError::BackendTimeout { addr: a, .. } if a == addr));
        assert_eq!(err.stage(), Stage::BackendDial);
        assert!(started.elapsed() < Duration::from_secs(2));
        holder.abort();
    }

    #[tokio::test]
    async fn dial_refused_is_backend_dial_error() {
        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = unused.local_addr().unwrap();
        drop(unused);

        let connector = crate::mux::tls::backend_connector().unwrap();
        let dialer = BackendDialer::new(dead_addr, connector).with_timeout(Duration::from_secs(2));

        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.stage(), Stage::BackendDial);
    }
}
