//! Control and data stream setup over a QUIC connection
//!
//! The side that opens a stream writes the liveness byte; the side that
//! accepts it reads that byte before using the stream. QUIC only tells the
//! peer about a stream once something is sent on it, so the byte doubles as
//! the stream announcement.

use crate::handshake::{ping, pong};
use quictun_transport::{
    CloseReason, MuxTransport, SessionCloser, TransportError, TransportResult,
};
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long closing waits for the endpoint to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side of the stream handshake this end plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Opens streams and sends the liveness byte (client)
    Open,
    /// Accepts streams and waits for the liveness byte (server)
    Accept,
}

impl StreamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Open => "client",
            StreamRole::Accept => "server",
        }
    }
}

/// Open or accept one bidirectional stream and run the liveness exchange on it
pub async fn establish_stream(
    connection: &Connection,
    role: StreamRole,
) -> TransportResult<(SendStream, RecvStream)> {
    match role {
        StreamRole::Open => {
            let (mut send, recv) = connection
                .open_bi()
                .await
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
            ping(&mut send).await?;
            Ok((send, recv))
        }
        StreamRole::Accept => {
            let (send, mut recv) = connection
                .accept_bi()
                .await
                .map_err(|e| TransportError::ConnectionError(e.to_string()))?;
            pong(&mut recv).await?;
            Ok((send, recv))
        }
    }
}

/// Bring up the data stream set in the background
///
/// Streams are attached to the transport as they come up, so writers can
/// start before the whole set exists. If stream `i` fails, the ones before
/// it are shut down and the transport's read side reports end-of-stream.
pub fn spawn_data_streams(
    connection: Connection,
    transport: Arc<MuxTransport>,
    role: StreamRole,
) {
    tokio::spawn(async move {
        let total = transport.stream_count();
        info!("Starting {} {} data streams", total, role.as_str());

        for index in 0..total {
            let attached = match establish_stream(&connection, role).await {
                Ok((send, recv)) => {
                    transport.attach_stream(index, Box::new(recv), Box::new(send))
                }
                Err(e) => Err(e),
            };

            if let Err(e) = attached {
                if !transport.is_closed() {
                    warn!("Data stream {} setup failed: {}", index, e);
                }
                transport.abandon_streams().await;
                return;
            }
        }

        transport.seal();
        debug!("All {} data streams up", total);
    });
}

/// Closes the QUIC connection and its endpoint
pub struct QuicCloser {
    connection: Connection,
    endpoint: Endpoint,
}

impl QuicCloser {
    pub fn new(connection: Connection, endpoint: Endpoint) -> Self {
        Self {
            connection,
            endpoint,
        }
    }
}

#[async_trait::async_trait]
impl SessionCloser for QuicCloser {
    async fn close(&self, reason: CloseReason) {
        if let Some(peer) = describe_peer_close(&self.connection) {
            info!("Connection already ended: {}", peer);
        }
        close_connection(&self.connection, reason);
        self.endpoint
            .close(quinn::VarInt::from_u32(reason.code()), reason.description().as_bytes());
        if tokio::time::timeout(DRAIN_TIMEOUT, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("Endpoint did not drain within {:?}", DRAIN_TIMEOUT);
        }
    }
}

/// Close a connection with the given reason code
pub fn close_connection(connection: &Connection, reason: CloseReason) {
    connection.close(
        quinn::VarInt::from_u32(reason.code()),
        reason.description().as_bytes(),
    );
    debug!(
        "QUIC connection {} closed: {} (code: {})",
        connection.stable_id(),
        reason,
        reason.code()
    );
}

/// Why the connection ended, if it already has
fn describe_peer_close(connection: &Connection) -> Option<String> {
    connection.close_reason().map(|error| describe_close(&error))
}

fn describe_close(error: &quinn::ConnectionError) -> String {
    match error {
        quinn::ConnectionError::ApplicationClosed(close) => format!(
            "peer closed: {} (code {})",
            quictun_transport::describe_close_code(close.error_code.into_inner() as u32),
            close.error_code
        ),
        other => other.to_string(),
    }
}
