//! Private CA and leaf certificate generation
//!
//! Every quictun deployment trusts exactly one issuer. Servers and clients
//! each get a leaf signed by it; the leaf's common name is what the peer
//! pins with `--common-name`.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::path::Path;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// CA certificates stay valid for ten years
const CA_VALIDITY_DAYS: i64 = 3650;

/// Leaf certificates stay valid for two years
const LEAF_VALIDITY_DAYS: i64 = 825;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::GenerationFailed(err.to_string())
    }
}

/// What a leaf certificate may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Server,
    Client,
}

fn validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    // Backdated a little to tolerate clock skew between peers
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(days);
}

fn subject(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "quictun");
    dn
}

/// A self-signed issuer able to sign leaf certificates
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self, CertError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        validity(&mut params, CA_VALIDITY_DAYS);

        let key =
            KeyPair::generate().map_err(|e| CertError::KeyGenerationFailed(e.to_string()))?;
        let cert = params.self_signed(&key)?;
        debug!("Generated CA certificate '{}'", common_name);

        Ok(Self { cert, key })
    }

    /// Sign a new leaf certificate
    ///
    /// Server certificates always cover `localhost` and `127.0.0.1` in
    /// addition to `extra_names`.
    pub fn issue(
        &self,
        common_name: &str,
        usage: CertUsage,
        extra_names: &[String],
    ) -> Result<IssuedCertificate, CertError> {
        let names: Vec<String> = match usage {
            CertUsage::Server => {
                let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
                for name in extra_names {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                names
            }
            CertUsage::Client => extra_names.to_vec(),
        };

        let mut params = CertificateParams::new(names)?;
        params.distinguished_name = subject(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![match usage {
            CertUsage::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertUsage::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }];
        params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));
        validity(&mut params, LEAF_VALIDITY_DAYS);

        let key =
            KeyPair::generate().map_err(|e| CertError::KeyGenerationFailed(e.to_string()))?;
        let cert = params.signed_by(&key, &self.cert, &self.key)?;
        debug!("Issued {:?} certificate '{}'", usage, common_name);

        IssuedCertificate::new(cert.der().to_vec(), cert.pem(), &key)
    }

    pub fn pem_cert(&self) -> String {
        self.cert.pem()
    }

    pub fn pem_key(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert.der().to_vec())
    }

    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, self.pem_cert())?;
        std::fs::write(key_path, self.pem_key())?;
        Ok(())
    }
}

/// A CA-signed certificate with its private key
pub struct IssuedCertificate {
    /// Certificate in DER format (binary)
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format (binary)
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format (text)
    pub pem_cert: String,

    /// Private key in PEM format (text)
    pub pem_key: String,
}

impl IssuedCertificate {
    fn new(cert_der: Vec<u8>, pem_cert: String, key: &KeyPair) -> Result<Self, CertError> {
        Ok(Self {
            cert_der: CertificateDer::from(cert_der),
            key_der: PrivateKeyDer::try_from(key.serialize_der())
                .map_err(|e| CertError::KeyGenerationFailed(e.to_string()))?,
            pem_cert,
            pem_key: key.serialize_pem(),
        })
    }

    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}
