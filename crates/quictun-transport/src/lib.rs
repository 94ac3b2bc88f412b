//! Transport abstraction for quictun sessions
//!
//! A [`Transport`] is one connection attempt to a peer. It exposes two
//! planes over a single capability set:
//!
//! ```text
//!   write(payload) ──► random data stream ──► [len u16][payload]
//!                        (1 of N streams)
//!
//!   N reader tasks ──► bounded merge queue ──► read(buf)
//!
//!   read_command / write_command ──► dedicated control stream
//! ```
//!
//! The data plane gives no ordering guarantee across streams. The control
//! plane is a single ordered stream that never carries data frames.
//!
//! [`MuxTransport`] implements the multiplexing over any set of
//! `AsyncRead`/`AsyncWrite` halves; the QUIC crate plugs quinn streams into it.

pub mod mux;
pub mod pool;

use async_trait::async_trait;
use quictun_proto::{CodecError, ControlCommand};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use mux::{BoxedReader, BoxedWriter, MuxTransport, NullCloser, SessionCloser};
pub use pool::{BufferPool, PoolStats, PooledBuffer};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Short buffer: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl TransportError {
    /// True for errors after which the transport will never deliver again
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::StreamClosed)
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::NotConnected => TransportError::StreamClosed,
                _ => TransportError::IoError(e),
            },
            CodecError::PayloadTooLarge(n) => TransportError::PayloadTooLarge(n),
            CodecError::ShortBuffer { needed, available } => {
                TransportError::ShortBuffer { needed, available }
            }
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Reason code sent to the peer when a transport is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Graceful,
    ControlSetup,
}

impl CloseReason {
    pub fn code(self) -> u32 {
        match self {
            CloseReason::Graceful => 0,
            CloseReason::ControlSetup => 1,
        }
    }

    pub fn description(self) -> &'static str {
        describe_close_code(self.code())
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Human-readable text for a close code received from the peer
pub fn describe_close_code(code: u32) -> &'static str {
    match code {
        0 => "graceful shutdown",
        1 => "control stream can't be opened",
        _ => "undefined",
    }
}

/// One connection attempt's worth of data and control plane
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read the next data frame payload into `buf`, returning its length
    ///
    /// Frames arrive in whatever order the per-stream readers decode them.
    /// Returns [`TransportError::StreamClosed`] once every data stream is gone.
    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Send one data frame on a randomly chosen data stream
    async fn write(&self, payload: &[u8]) -> TransportResult<usize>;

    /// Read one command from the control stream
    async fn read_command(&self) -> TransportResult<ControlCommand>;

    /// Write one command to the control stream
    async fn write_command(&self, command: &ControlCommand) -> TransportResult<()>;

    /// Close the control stream and the connection. Safe to call more than once.
    async fn close(&self, reason: CloseReason);

    /// Point-in-time buffer pool counters
    fn stats(&self) -> String;
}

/// Tuning knobs shared by every transport implementation
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Number of data streams per connection
    pub streams: usize,
    /// Maximum number of live buffers
    pub pool_capacity: usize,
    /// Size of each pooled buffer, frame header included
    pub buffer_size: usize,
    /// How many decoded frames may wait for a reader
    pub queue_capacity: usize,
    /// Destroy buffers idle for longer than this
    pub pool_idle_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            streams: 30,
            pool_capacity: 300,
            buffer_size: 4096,
            queue_capacity: 1000,
            pool_idle_timeout: None,
        }
    }
}

impl TransportOptions {
    /// Largest frame payload that fits a pooled buffer on the receiving side
    pub fn max_payload(&self) -> usize {
        self.buffer_size
            .saturating_sub(quictun_proto::FRAME_HEADER_LEN)
            .min(quictun_proto::MAX_PAYLOAD_LEN)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.streams == 0 {
            return Err(TransportError::ConfigurationError(
                "at least one data stream is required".to_string(),
            ));
        }
        if self.pool_capacity == 0 || self.queue_capacity == 0 {
            return Err(TransportError::ConfigurationError(
                "pool and queue capacity must be non-zero".to_string(),
            ));
        }
        if self.buffer_size <= quictun_proto::FRAME_HEADER_LEN {
            return Err(TransportError::ConfigurationError(format!(
                "buffer size {} cannot hold a frame",
                self.buffer_size
            )));
        }
        Ok(())
    }
}
