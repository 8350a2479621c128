//! TLS contexts for both legs of a proxy session.
//!
//! The client-facing leg terminates TLS with the provisioned certificate
//! bundle. The backend leg dials a loopback backend whose certificate is
//! self-signed, so chain validation is skipped there; handshake signatures are
//! still checked against the presented key.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Errors building TLS contexts.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    /// Could not read a PEM file.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The certificate file contained no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file contained no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// rustls rejected the configuration.
    #[error("tls configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Load a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsSetupError> {
    let read_err = |source| TlsSetupError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;

    if certs.is_empty() {
        return Err(TlsSetupError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsSetupError> {
    let read_err = |source| TlsSetupError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(read_err)?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.to_path_buf()))
}

/// Build the server-side context used to terminate client TLS.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build an acceptor for the client-facing leg.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsSetupError> {
    server_config(cert_path, key_path).map(TlsAcceptor::from)
}

/// Build a connector for the backend leg that skips chain verification.
pub fn backend_connector() -> Result<TlsConnector, TlsSetupError> {
    let provider = provider();
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipChainVerification(provider)))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any backend certificate; the backend is trusted because it only
/// listens on loopback.
#[derive(Debug)]
struct SkipChainVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipChainVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn server_config_from_generated_pem() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = write_temp(dir.path(), "server.crt", &cert.cert.pem());
        let key_path = write_temp(dir.path(), "server.key", &cert.key_pair.serialize_pem());

        assert!(server_config(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = server_config(&dir.path().join("nope.crt"), &dir.path().join("nope.key"))
            .unwrap_err();
        assert!(matches!(err, TlsSetupError::Read { .. }));
    }

    #[test]
    fn empty_pem_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = write_temp(dir.path(), "server.crt", "");
        let key_path = write_temp(dir.path(), "server.key", "");
        assert!(matches!(
            load_certs(&cert_path),
            Err(TlsSetupError::NoCertificates(_))
        ));
        assert!(matches!(
            load_private_key(&key_path),
            Err(TlsSetupError::NoPrivateKey(_))
        ));
    }

    #[test]
    fn backend_connector_builds() {
        assert!(backend_connector().is_ok());
    }
}
