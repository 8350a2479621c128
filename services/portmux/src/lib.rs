//! portmux: one public port for both HTTPS and plaintext HTTP.
//!
//! TLS connections are terminated and relayed to a loopback TLS backend;
//! plaintext connections get a single redirect to the HTTPS endpoint.

pub mod cert;
pub mod config;
pub mod mux;
pub mod supervisor;

pub use cert::{ensure_certificate, CertificateBundle, CertificateTool, OpensslTool};
pub use config::{Cli, Config, LogFormat};
pub use mux::{Listener, ListenerConfig, ListenerStats};
pub use supervisor::{BackendCommand, BackendSupervisor};
