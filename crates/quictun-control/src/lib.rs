//! Control plane for quictun sessions
//!
//! All control traffic goes through a [`ControlChannel`], which owns the
//! transport's control stream and runs one request/reply exchange at a time.
//! Route negotiation is built on top of it.

pub mod channel;
pub mod negotiation;

pub use channel::ControlChannel;
pub use negotiation::{
    accept_routes, announce_routes, negotiate, RouteApplyError, RouteTable,
};

use quictun_proto::{CommandType, RouteError};
use quictun_transport::TransportError;
use std::fmt;
use thiserror::Error;

/// Which end of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unexpected command {got}, expected {expected}")]
    UnexpectedCommand {
        expected: CommandType,
        got: CommandType,
    },

    #[error("Peer rejected routes [{0}]")]
    Rejected(String),

    #[error("Invalid route list: {0}")]
    InvalidRoutes(#[from] RouteError),

    #[error("Route application failed: {0}")]
    RouteApplication(#[from] RouteApplyError),

    #[error("Route negotiation failed: {0}")]
    Negotiation(String),
}

pub type ControlResult<T> = Result<T, ControlError>;
