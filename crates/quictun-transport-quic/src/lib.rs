//! QUIC transport for quictun, built on quinn
//!
//! Both ends authenticate with certificates issued by a shared CA. After the
//! TLS handshake the peer's common name can be pinned, then the control
//! stream comes up (liveness ping from the client, pong on the server)
//! followed by the data stream set.
//!
//! # Example
//!
//! ```no_run
//! use quictun_transport::{Transport, TransportOptions};
//! use quictun_transport_quic::{Handshake, QuicClient, QuicConfig, QuicServer};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handshake = Handshake::new(TransportOptions::default(), Some("client".to_string()));
//!
//! // Server side
//! let config = QuicConfig::new("server.pem", "server.key", "ca.pem");
//! let server = QuicServer::bind("0.0.0.0:1234".parse()?, &config)?;
//! let transport = server.accept(&handshake).await?;
//!
//! // Client side
//! let config = QuicConfig::new("client.pem", "client.key", "ca.pem");
//! let addr = "192.0.2.1:1234".parse()?;
//! let transport = QuicClient::new(addr, &config)?
//!     .connect(addr, "localhost", &handshake)
//!     .await?;
//! transport.write(b"hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod handshake;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicClient;
pub use handshake::{Handshake, SequenceCounter};
pub use listener::QuicServer;
pub use stream::StreamRole;
