//! Client side: dial the server and build the transport

use quictun_transport::{CloseReason, MuxTransport, TransportError, TransportResult};
use quinn::Endpoint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, info_span, Instrument};

use crate::config::QuicConfig;
use crate::handshake::{handshake_failure, Handshake};
use crate::stream::{close_connection, establish_stream, spawn_data_streams, QuicCloser, StreamRole};

/// QUIC dialer for one connection attempt
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    /// Create a client endpoint bound to an ephemeral port of the server's address family
    pub fn new(server_addr: SocketAddr, config: &QuicConfig) -> TransportResult<Self> {
        let client_config = config.build_client_config()?;

        let bind_addr: SocketAddr = if server_addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind_addr).map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(client_config);

        debug!("QUIC client endpoint created");
        Ok(Self { endpoint })
    }

    /// Dial, authenticate the server and set up the control stream
    ///
    /// Data streams are opened in the background after this returns.
    pub async fn connect(
        self,
        server_addr: SocketAddr,
        server_name: &str,
        handshake: &Handshake,
    ) -> TransportResult<Arc<MuxTransport>> {
        let attempt = handshake.next_attempt();
        let span = info_span!("handshake", role = "client", attempt);
        let endpoint = self.endpoint.clone();

        let result = self
            .connect_inner(server_addr, server_name, handshake)
            .instrument(span)
            .await;
        if result.is_err() {
            endpoint.close(
                quinn::VarInt::from_u32(CloseReason::Graceful.code()),
                CloseReason::Graceful.description().as_bytes(),
            );
            debug!("Cleaned up client endpoint after failed setup");
        }
        result
    }

    async fn connect_inner(
        self,
        server_addr: SocketAddr,
        server_name: &str,
        handshake: &Handshake,
    ) -> TransportResult<Arc<MuxTransport>> {
        debug!("Connecting to QUIC server: {} ({})", server_name, server_addr);

        let connecting = self
            .endpoint
            .connect(server_addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| handshake_failure(server_addr, e))?;

        info!("QUIC connection established to {} ({})", server_name, server_addr);

        if let Err(e) = handshake.verify_peer(&connection) {
            close_connection(&connection, CloseReason::Graceful);
            return Err(e);
        }

        let (control_send, control_recv) =
            match establish_stream(&connection, StreamRole::Open).await {
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
        spawn_data_streams(connection, transport.clone(), StreamRole::Open);

        Ok(transport)
    }
}
