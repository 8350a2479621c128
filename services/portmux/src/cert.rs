//! Self-signed certificate provisioning.
//!
//! The public listener cannot start without a certificate bundle. On first
//! start for an environment the bundle is generated with an external tool
//! (`openssl` by default); afterwards the existing files are used as is and
//! are never rotated.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::{debug, info};

/// Certificate file name inside the environment directory.
pub const CERT_FILE: &str = "server.crt";

/// Private key file name inside the environment directory.
pub const KEY_FILE: &str = "server.key";

/// RSA modulus size of generated keys.
pub const RSA_BITS: u32 = 2048;

/// Validity of generated certificates.
pub const VALIDITY_DAYS: u32 = 365;

/// Subject common name of generated certificates.
pub const COMMON_NAME: &str = "localhost";

/// Errors from certificate provisioning.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to create certificate directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("certificate tool finished but {0} is missing")]
    Missing(PathBuf),
}

/// On-disk certificate and key pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificateBundle {
    /// Bundle paths inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join(CERT_FILE),
            key_path: dir.join(KEY_FILE),
        }
    }

    /// Whether the certificate file is present. The key is assumed to travel
    /// with it.
    pub fn exists(&self) -> bool {
        self.cert_path.is_file()
    }
}

/// Something that can write a new self-signed bundle.
pub trait CertificateTool {
    fn generate(&self, bundle: &CertificateBundle) -> Result<(), CertError>;
}

/// Generates bundles by running `openssl req -x509`.
#[derive(Debug, Clone)]
pub struct OpensslTool {
    program: String,
}

impl OpensslTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments passed to the tool for `bundle`.
    pub fn args(&self, bundle: &CertificateBundle) -> Vec<OsString> {
        vec![
            "req".into(),
            "-x509".into(),
            "-newkey".into(),
            format!("rsa:{}", RSA_BITS).into(),
            "-nodes".into(),
            "-keyout".into(),
            bundle.key_path.clone().into_os_string(),
            "-out".into(),
            bundle.cert_path.clone().into_os_string(),
            "-days".into(),
            VALIDITY_DAYS.to_string().into(),
            "-subj".into(),
            format!("/CN={}", COMMON_NAME).into(),
        ]
    }
}

impl Default for OpensslTool {
    fn default() -> Self {
        Self::new("openssl")
    }
}

impl CertificateTool for OpensslTool {
    fn generate(&self, bundle: &CertificateBundle) -> Result<(), CertError> {
        let output = Command::new(&self.program)
            .args(self.args(bundle))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| CertError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CertError::ToolFailed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Make sure a certificate bundle exists in `dir`, generating one if needed.
///
/// Creates `dir` as needed. When the certificate file is already present
/// nothing is written.
pub fn ensure_certificate(
    dir: &Path,
    tool: &dyn CertificateTool,
) -> Result<CertificateBundle, CertError> {
    let bundle = CertificateBundle::in_dir(dir);

    if bundle.exists() {
        debug!(cert_path = %bundle.cert_path.display(), "Using existing certificate");
        return Ok(bundle);
    }

    fs::create_dir_all(dir).map_err(|source| CertError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    info!(
        cert_path = %bundle.cert_path.display(),
        key_path = %bundle.key_path.display(),
        "Generating self-signed certificate"
    );
    tool.generate(&bundle)?;

    for path in [&bundle.cert_path, &bundle.key_path] {
        if !path.is_file() {
            return Err(CertError::Missing(path.clone()));
        }
    }

    Ok(bundle)
}
