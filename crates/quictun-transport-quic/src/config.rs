//! QUIC transport configuration with mutual TLS

use quictun_transport::{TransportError, TransportResult};
use quinn::rustls;
use quinn::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// ALPN token both sides must agree on
pub const ALPN_PROTOCOL: &str = "quic";

/// Certificate material and QUIC transport parameters
///
/// Both roles present a certificate and verify the peer's against the
/// same trusted issuer.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Local certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Local private key (PEM)
    pub key_path: PathBuf,

    /// Trusted issuer certificate (PEM)
    pub ca_path: PathBuf,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.into(),
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(10),
            max_concurrent_streams: 100,
        }
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set maximum concurrent streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        for (what, path) in [
            ("certificate", &self.cert_path),
            ("private key", &self.key_path),
            ("CA certificate", &self.ca_path),
        ] {
            if !path.exists() {
                return Err(TransportError::ConfigurationError(format!(
                    "{} file not found: {}",
                    what,
                    path.display()
                )));
            }
        }

        Ok(())
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle = quinn::IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| TransportError::ConfigurationError(format!("Idle timeout: {}", e)))?;
        let streams = quinn::VarInt::from_u64(self.max_concurrent_streams).map_err(|e| {
            TransportError::ConfigurationError(format!("Max streams: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle));
        transport.max_concurrent_bidi_streams(streams);
        Ok(transport)
    }

    fn trusted_roots(&self) -> TransportResult<rustls::RootCertStore> {
        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(&self.ca_path)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::TlsError(format!("Invalid CA cert: {}", e)))?;
        }
        if roots.is_empty() {
            return Err(TransportError::TlsError(format!(
                "No CA certificate in {}",
                self.ca_path.display()
            )));
        }
        Ok(roots)
    }

    /// Build quinn ServerConfig requiring a client certificate from our issuer
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(self.trusted_roots()?))
            .build()
            .map_err(|e| TransportError::TlsError(format!("Client verifier: {}", e)))?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
        server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.as_bytes().to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok(server_config)
    }

    /// Build quinn ClientConfig presenting our certificate
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        ensure_crypto_provider();

        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let mut client_crypto = rustls::ClientConfig::builder()
            .with_root_certificates(self.trusted_roots()?)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
        client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.as_bytes().to_vec()];

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}
