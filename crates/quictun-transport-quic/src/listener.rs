//! Server side: accept one peer and build its transport

use quictun_transport::{
    CloseReason, MuxTransport, TransportError, TransportResult,
};
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument};

use crate::config::QuicConfig;
use crate::handshake::{handshake_failure, Handshake};
use crate::stream::{close_connection, establish_stream, spawn_data_streams, QuicCloser, StreamRole};

/// QUIC listener serving exactly one peer per connection attempt
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(bind_addr: SocketAddr, config: &QuicConfig) -> TransportResult<Self> {
        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;
        info!("Server listening on {}", local_addr);

        Ok(Self { endpoint })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    /// Accept one peer, authenticate it and set up the control stream
    ///
    /// The listener is owned by the returned transport and closes with it.
    /// Data streams keep arriving in the background after this returns.
    pub async fn accept(self, handshake: &Handshake) -> TransportResult<Arc<MuxTransport>> {
        let attempt = handshake.next_attempt();
        let span = info_span!("handshake", role = "server", attempt);
        let endpoint = self.endpoint.clone();

        let result = self.accept_inner(handshake).instrument(span).await;
        if result.is_err() {
            endpoint.close(
                quinn::VarInt::from_u32(CloseReason::Graceful.code()),
                CloseReason::Graceful.description().as_bytes(),
            );
            debug!("Cleaned up server endpoint after failed setup");
        }
        result
    }

    async fn accept_inner(self, handshake: &Handshake) -> TransportResult<Arc<MuxTransport>> {
        let incoming = self.endpoint.accept().await.ok_or_else(|| {
            TransportError::ConnectionError("QUIC endpoint closed".to_string())
        })?;
        let remote = incoming.remote_address();
        debug!("Incoming QUIC connection from {}", remote);

        let connection = incoming
            .await
            .map_err(|e| handshake_failure(remote, e))?;
        info!("QUIC connection established from {}", remote);

        if let Err(e) = handshake.verify_peer(&connection) {
            close_connection(&connection, CloseReason::Graceful);
            return Err(e);
        }

        let (control_send, control_recv) =
            match establish_stream(&connection, StreamRole::Accept).await {
                Ok(streams) => streams,
                Err(e) => {
                    close_connection(&connection, CloseReason::ControlSetup);
                    return Err(e);
                }
            };
        debug!("Control stream ready");

        let transport = Arc::new(MuxTransport::new(
            &handshake.options,
            Box::new(control_recv),
            Box::new(control_send),
            Box::new(QuicCloser::new(connection.clone(), self.endpoint)),
        ));
        spawn_data_streams(connection, transport.clone(), StreamRole::Accept);

        Ok(transport)
    }
}
