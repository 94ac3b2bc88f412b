//! Peer authentication and stream liveness checks

use quictun_proto::LIVENESS_BYTE;
use quictun_transport::{TransportError, TransportOptions, TransportResult};
use quinn::rustls::pki_types::CertificateDer;
use quinn::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Sequence numbers wrap at this value
const SEQUENCE_MODULUS: u64 = 100_000_000;

/// Monotonic counter handing out per-attempt sequence numbers
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `value` (tests pin the sequence this way)
    pub fn starting_at(value: u64) -> Self {
        Self {
            next: AtomicU64::new(value),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) % SEQUENCE_MODULUS
    }
}

/// Everything a server or client needs to bring a transport up
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Required common name of the peer certificate
    pub expected_peer: Option<String>,
    pub options: TransportOptions,
    counter: Arc<SequenceCounter>,
}

impl Handshake {
    pub fn new(options: TransportOptions, expected_peer: Option<String>) -> Self {
        Self::with_counter(options, expected_peer, Arc::new(SequenceCounter::new()))
    }

    pub fn with_counter(
        options: TransportOptions,
        expected_peer: Option<String>,
        counter: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            expected_peer: expected_peer.filter(|name| !name.is_empty()),
            options,
            counter,
        }
    }

    /// Sequence number identifying the next setup attempt
    pub fn next_attempt(&self) -> u64 {
        self.counter.next()
    }

    /// Check the peer certificate against the configured identity
    pub fn verify_peer(&self, connection: &Connection) -> TransportResult<()> {
        let Some(expected) = self.expected_peer.as_deref() else {
            return Ok(());
        };

        let actual = peer_common_name(connection)?;
        match actual.as_deref() {
            Some(name) if name == expected => {
                debug!("Peer identity verified: {}", name);
                Ok(())
            }
            other => Err(TransportError::AuthenticationFailed(format!(
                "invalid cert name {} != expected: {}",
                other.unwrap_or("<none>"),
                expected
            ))),
        }
    }
}

/// Map a failed QUIC handshake to a transport error
///
/// Failures carrying a TLS alert, raised locally or by the peer, mean a
/// certificate was rejected; anything else is a plain connection failure.
pub fn handshake_failure(peer: impl std::fmt::Display, error: quinn::ConnectionError) -> TransportError {
    let tls_alert = match &error {
        quinn::ConnectionError::TransportError(e) => is_crypto_code(e.code),
        quinn::ConnectionError::ConnectionClosed(close) => is_crypto_code(close.error_code),
        _ => false,
    };
    let message = format!("handshake with {} failed: {}", peer, error);
    if tls_alert {
        TransportError::AuthenticationFailed(message)
    } else {
        TransportError::ConnectionError(message)
    }
}

/// TLS alerts travel as transport error codes 0x100..=0x1ff
fn is_crypto_code(code: quinn::TransportErrorCode) -> bool {
    (0x100..0x200).contains(&u64::from(code))
}

/// Common name of the verified peer's end-entity certificate
pub fn peer_common_name(connection: &Connection) -> TransportResult<Option<String>> {
    let identity = connection.peer_identity().ok_or_else(|| {
        TransportError::AuthenticationFailed("peer presented no certificate".to_string())
    })?;
    let chain = identity
        .downcast::<Vec<CertificateDer<'static>>>()
        .map_err(|_| TransportError::AuthenticationFailed("unexpected peer identity".to_string()))?;
    let leaf = chain.first().ok_or_else(|| {
        TransportError::AuthenticationFailed("empty peer certificate chain".to_string())
    })?;

    common_name(leaf.as_ref())
}

/// Extract the subject common name from a DER certificate
pub fn common_name(der: &[u8]) -> TransportResult<Option<String>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse peer cert: {}", e)))?;

    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    Ok(name)
}

/// Announce a freshly opened stream to the peer
pub async fn ping<W>(writer: &mut W) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&[LIVENESS_BYTE]).await?;
    Ok(())
}

/// Wait for the peer's announcement on an accepted stream
pub async fn pong<R>(reader: &mut R) -> TransportResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).await?;
    if byte[0] != LIVENESS_BYTE {
        return Err(TransportError::ProtocolError(format!(
            "unexpected liveness byte 0x{:02x}",
            byte[0]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_alert_is_authentication_failure() {
        // bad_certificate
        assert!(is_crypto_code(quinn::TransportErrorCode::crypto(42)));
        assert!(!is_crypto_code(quinn::TransportErrorCode::PROTOCOL_VIOLATION));

        let err = handshake_failure("127.0.0.1:1234", quinn::ConnectionError::TimedOut);
        assert!(matches!(err, TransportError::ConnectionError(_)));
    }

    #[test]
    fn test_sequence_counter_wraps() {
        let counter = SequenceCounter::starting_at(SEQUENCE_MODULUS - 1);
        assert_eq!(counter.next(), SEQUENCE_MODULUS - 1);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_shared_counter() {
        let counter = Arc::new(SequenceCounter::new());
        let a = Handshake::with_counter(TransportOptions::default(), None, counter.clone());
        let b = Handshake::with_counter(TransportOptions::default(), None, counter);
        assert_eq!(a.next_attempt(), 0);
        assert_eq!(b.next_attempt(), 1);
        assert_eq!(a.next_attempt(), 2);
    }

    #[test]
    fn test_empty_identity_means_unconstrained() {
        let handshake = Handshake::new(TransportOptions::default(), Some(String::new()));
        assert!(handshake.expected_peer.is_none());
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (mut a, mut b) = tokio::io::duplex(8);
        ping(&mut a).await.unwrap();
        pong(&mut b).await.unwrap();
    }

    #[tokio::test]
    async fn test_pong_fails_on_closed_stream() {
        let (a, mut b) = tokio::io::duplex(8);
        drop(a);
        assert!(pong(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_pong_rejects_wrong_byte() {
        let (mut a, mut b) = tokio::io::duplex(8);
        a.write_all(&[0x7F]).await.unwrap();
        assert!(matches!(
            pong(&mut b).await,
            Err(TransportError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_common_name_from_generated_cert() {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "vpn-server");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let name = common_name(cert.der()).unwrap();
        assert_eq!(name.as_deref(), Some("vpn-server"));
    }
}
