//! Certificate material for quictun peers
//!
//! Generates a private CA together with a server and a client leaf, and
//! writes them in the file layout the CLI expects by default.

pub mod authority;

pub use authority::{CertError, CertUsage, CertificateAuthority, IssuedCertificate};

use std::path::{Path, PathBuf};
use tracing::info;

/// File names written by [`CertSet::write_to_dir`]
pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca.key";
pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server.key";
pub const CLIENT_CERT_FILE: &str = "client.pem";
pub const CLIENT_KEY_FILE: &str = "client.key";

/// Names to put in a freshly generated certificate set
#[derive(Debug, Clone)]
pub struct CertSetParams {
    pub ca_name: String,
    pub server_name: String,
    pub client_name: String,
    /// Extra DNS names or IP addresses for the server certificate
    pub server_alt_names: Vec<String>,
}

impl Default for CertSetParams {
    fn default() -> Self {
        Self {
            ca_name: "quictun CA".to_string(),
            server_name: "server".to_string(),
            client_name: "client".to_string(),
            server_alt_names: Vec::new(),
        }
    }
}

/// A CA plus one server and one client certificate
pub struct CertSet {
    pub ca: CertificateAuthority,
    pub server: IssuedCertificate,
    pub client: IssuedCertificate,
}

/// Paths of a certificate set on disk
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl CertPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca_cert: dir.join(CA_CERT_FILE),
            ca_key: dir.join(CA_KEY_FILE),
            server_cert: dir.join(SERVER_CERT_FILE),
            server_key: dir.join(SERVER_KEY_FILE),
            client_cert: dir.join(CLIENT_CERT_FILE),
            client_key: dir.join(CLIENT_KEY_FILE),
        }
    }
}

impl CertSet {
    pub fn generate(params: &CertSetParams) -> Result<Self, CertError> {
        let ca = CertificateAuthority::generate(&params.ca_name)?;
        let server = ca.issue(
            &params.server_name,
            CertUsage::Server,
            &params.server_alt_names,
        )?;
        let client = ca.issue(&params.client_name, CertUsage::Client, &[])?;
        Ok(Self { ca, server, client })
    }

    /// Write all six PEM files into `dir`, creating it if needed
    pub fn write_to_dir(&self, dir: &Path) -> Result<CertPaths, CertError> {
        std::fs::create_dir_all(dir)?;
        let paths = CertPaths::in_dir(dir);

        self.ca.save_to_files(&paths.ca_cert, &paths.ca_key)?;
        self.server
            .save_to_files(&paths.server_cert, &paths.server_key)?;
        self.client
            .save_to_files(&paths.client_cert, &paths.client_key)?;

        info!("Wrote certificates to {}", dir.display());
        Ok(paths)
    }
}
