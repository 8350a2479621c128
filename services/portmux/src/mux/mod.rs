//! Single-port TLS/HTTP multiplexer.
//!
//! This module provides:
//! - Non-destructive protocol sniffing
//! - Plaintext HTTP to HTTPS redirects
//! - TLS termination and re-encrypted backend proxying
//! - The public listener with connection limits and drain
//!
//! ## Architecture
//!
//! ```text
//!                      +--> Http -> Redirector (301, close)
//! Client -> Listener --+--> Tls  -> TlsTerminator -> BackendDialer -> ProxySession
//!           (Sniffer)  +--> Unknown -> drop
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portmux::mux::{tls, BackendDialer, Listener, ListenerConfig, TracingReporter};
//!
//! let acceptor = tls::acceptor(&cert_path, &key_path)?;
//! let dialer = BackendDialer::new("127.0.0.1:8086".parse()?, tls::backend_connector()?);
//! let config = ListenerConfig::new("0.0.0.0:8085".parse()?);
//! let listener = Listener::bind(config, acceptor, dialer, Arc::new(TracingReporter)).await?;
//! listener.run(shutdown_rx).await?;
//! ```

mod listener;
mod redirect;
mod report;
mod session;
mod sniff;
pub mod tls;

pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use redirect::{read_request_head, RedirectTarget, Redirector, MAX_REQUEST_HEAD};
pub use report::{ErrorReporter, NullReporter, TracingReporter};
pub use session::{
    BackendDialer, Direction, ProxySession, SessionBytes, SessionError, Stage, TlsTerminator,
    DEFAULT_IO_TIMEOUT, PROXY_CHUNK,
};
pub use sniff::{classify_bytes, Protocol, Sniffer, DEFAULT_SNIFF_TIMEOUT, SNIFF_BYTES};
