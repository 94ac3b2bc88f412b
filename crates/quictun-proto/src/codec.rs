//! Codecs for data frames and control commands

use crate::command::{CommandType, ControlCommand};
use crate::{COMMAND_HEADER_LEN, FRAME_HEADER_LEN, MAX_PAYLOAD_LEN};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
///
/// Any error returned while reading means the stream is no longer usable:
/// the reader cannot know where the next unit starts.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD_LEN})")]
    PayloadTooLarge(usize),

    #[error("Short buffer: frame needs {needed} bytes but buffer holds {available}")]
    ShortBuffer { needed: usize, available: usize },

    #[error("Length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Truncated header: {0} bytes")]
    TruncatedHeader(usize),
}

impl CodecError {
    /// True when the error came from the underlying stream rather than the bytes on it
    pub fn is_io(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

fn length_prefix(len: usize) -> Result<[u8; 2], CodecError> {
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(len));
    }
    Ok((len as u16).to_be_bytes())
}

/// Data frame codec
///
/// Format: [length: u16][payload]
pub struct FrameCodec;

impl FrameCodec {
    /// Write one frame: the length prefix, then the payload
    ///
    /// Oversize payloads are rejected before anything touches the stream.
    pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let header = length_prefix(payload.len())?;
        writer.write_all(&header).await?;
        writer.write_all(payload).await?;
        Ok(())
    }

    /// Read one frame into `buf`
    ///
    /// The header lands in `buf[..2]` and the payload in `buf[2..2 + len]`;
    /// the returned value is the payload length. A declared length that does
    /// not fit in `buf` is rejected before any payload byte is read.
    pub async fn read_frame<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(CodecError::ShortBuffer {
                needed: FRAME_HEADER_LEN,
                available: buf.len(),
            });
        }

        reader.read_exact(&mut buf[..FRAME_HEADER_LEN]).await?;
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;

        let needed = FRAME_HEADER_LEN + len;
        if needed > buf.len() {
            return Err(CodecError::ShortBuffer {
                needed,
                available: buf.len(),
            });
        }

        reader.read_exact(&mut buf[FRAME_HEADER_LEN..needed]).await?;
        Ok(len)
    }
}

/// Control command codec
///
/// Format: [type: u8][length: u16][payload]
pub struct CommandCodec;

impl CommandCodec {
    pub async fn write_command<W>(writer: &mut W, command: &ControlCommand) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let encoded = command.encode()?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one command: the fixed header, then exactly the declared payload
    pub async fn read_command<R>(reader: &mut R) -> Result<ControlCommand, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; COMMAND_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let kind = CommandType::from(header[0]);
        let len = u16::from_be_bytes([header[1], header[2]]) as usize;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        Ok(ControlCommand::from_parts(kind, Bytes::from(payload)))
    }
}
