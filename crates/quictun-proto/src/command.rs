//! Control commands exchanged on the control stream

use crate::codec::CodecError;
use crate::routes::RouteSet;
use crate::{COMMAND_HEADER_LEN, MAX_PAYLOAD_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Command type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    /// Positive reply
    Ok,
    /// Route announcement, payload is the `;`-joined route list
    SubnetUpdate,
    /// Negative reply
    Fail,
    /// Any byte this side does not understand
    Other(u8),
}

impl CommandType {
    pub fn as_u8(self) -> u8 {
        match self {
            CommandType::Ok => 0x00,
            CommandType::SubnetUpdate => 0x01,
            CommandType::Fail => 0xF0,
            CommandType::Other(b) => b,
        }
    }
}

impl From<u8> for CommandType {
    fn from(b: u8) -> Self {
        match b {
            0x00 => CommandType::Ok,
            0x01 => CommandType::SubnetUpdate,
            0xF0 => CommandType::Fail,
            other => CommandType::Other(other),
        }
    }
}

impl From<CommandType> for u8 {
    fn from(kind: CommandType) -> Self {
        kind.as_u8()
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandType::Ok => write!(f, "OK"),
            CommandType::SubnetUpdate => write!(f, "SUBNET_UPDATE"),
            CommandType::Fail => write!(f, "FAIL"),
            CommandType::Other(b) => write!(f, "UNKNOWN(0x{:02x})", b),
        }
    }
}

/// A single control command: type byte plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    kind: CommandType,
    payload: Bytes,
}

impl ControlCommand {
    /// Build a command, rejecting payloads that do not fit the u16 length field
    pub fn new(kind: CommandType, payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { kind, payload })
    }

    pub(crate) fn from_parts(kind: CommandType, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    pub fn ok() -> Self {
        Self::from_parts(CommandType::Ok, Bytes::new())
    }

    pub fn fail() -> Self {
        Self::from_parts(CommandType::Fail, Bytes::new())
    }

    /// SUBNET_UPDATE carrying the given routes
    pub fn subnet_update(routes: &RouteSet) -> Result<Self, CodecError> {
        Self::new(CommandType::SubnetUpdate, routes.encode())
    }

    pub fn kind(&self) -> CommandType {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_ok(&self) -> bool {
        self.kind == CommandType::Ok
    }

    pub fn is_fail(&self) -> bool {
        self.kind == CommandType::Fail
    }

    /// Encode to [type][len: u16 BE][payload]
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.as_u8());
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a command from a complete buffer
    ///
    /// The buffer must hold exactly one command: a payload shorter or longer
    /// than the declared length is an error.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < COMMAND_HEADER_LEN {
            return Err(CodecError::TruncatedHeader(data.len()));
        }
        let kind = CommandType::from(data[0]);
        let declared = u16::from_be_bytes([data[1], data[2]]) as usize;
        let actual = data.len() - COMMAND_HEADER_LEN;
        if declared != actual {
            return Err(CodecError::LengthMismatch { declared, actual });
        }
        Ok(Self::from_parts(
            kind,
            Bytes::copy_from_slice(&data[COMMAND_HEADER_LEN..]),
        ))
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.kind, self.payload.len())
    }
}
