//! Per-attempt transport setup for each role

use async_trait::async_trait;
use quictun_transport::{Transport, TransportResult};
use quictun_transport_quic::{Handshake, QuicClient, QuicConfig, QuicServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Produces one authenticated transport per session attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn establish(&self) -> TransportResult<Arc<dyn Transport>>;
}

/// Binds, waits for one client and hands back its transport
pub struct QuicServerConnector {
    bind: SocketAddr,
    config: QuicConfig,
    handshake: Handshake,
}

impl QuicServerConnector {
    pub fn new(bind: SocketAddr, config: QuicConfig, handshake: Handshake) -> Self {
        Self {
            bind,
            config,
            handshake,
        }
    }
}

#[async_trait]
impl Connector for QuicServerConnector {
    async fn establish(&self) -> TransportResult<Arc<dyn Transport>> {
        let server = QuicServer::bind(self.bind, &self.config)?;
        info!("Waiting for client on {}", self.bind);
        let transport = server.accept(&self.handshake).await?;
        Ok(transport)
    }
}

/// Dials the server
pub struct QuicClientConnector {
    server: SocketAddr,
    server_name: String,
    config: QuicConfig,
    handshake: Handshake,
}

impl QuicClientConnector {
    pub fn new(
        server: SocketAddr,
        server_name: impl Into<String>,
        config: QuicConfig,
        handshake: Handshake,
    ) -> Self {
        Self {
            server,
            server_name: server_name.into(),
            config,
            handshake,
        }
    }
}

#[async_trait]
impl Connector for QuicClientConnector {
    async fn establish(&self) -> TransportResult<Arc<dyn Transport>> {
        let client = QuicClient::new(self.server, &self.config)?;
        let transport = client
            .connect(self.server, &self.server_name, &self.handshake)
            .await?;
        Ok(transport)
    }
}
