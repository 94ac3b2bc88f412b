//! Wire protocol for quictun
//!
//! Two length-prefixed units travel between peers:
//!
//! - **Frames** on the data streams: `len_hi, len_lo, payload[len]`
//! - **Control commands** on the control stream: `type, len_hi, len_lo, payload[len]`
//!
//! All integers are big-endian. Payloads never exceed [`MAX_PAYLOAD_LEN`] bytes.
//!
//! The crate also owns the route announcement format carried inside a
//! `SUBNET_UPDATE` command (see [`RouteSet`]).

pub mod codec;
pub mod command;
pub mod routes;

pub use codec::{CodecError, CommandCodec, FrameCodec};
pub use command::{CommandType, ControlCommand};
pub use routes::{split_route_list, RouteError, RouteSet};

/// Largest payload a frame or command can carry (16-bit length field)
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Size of the data frame header (2-byte length)
pub const FRAME_HEADER_LEN: usize = 2;

/// Size of the control command header (1-byte type + 2-byte length)
pub const COMMAND_HEADER_LEN: usize = 3;

/// Byte written by the opener of a stream and read by the acceptor
pub const LIVENESS_BYTE: u8 = 0x00;
