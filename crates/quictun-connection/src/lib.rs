//! Session lifecycle for quictun
//!
//! Ties a virtual interface to a transport: interface setup, transport
//! setup through a [`Connector`], route negotiation, the packet pumps and
//! the supervisor loop that rebuilds everything after a failure.

pub mod connector;
pub mod device;
pub mod reconnect;
pub mod session;
pub mod stats;
pub mod supervisor;

pub use connector::{Connector, QuicClientConnector, QuicServerConnector};
pub use device::{
    InterfaceError, InterfaceFactory, IpLinkControl, LinkControl, NetworkInterface,
    OpenedInterface, TunFactory, TunInterface, DEFAULT_INTERFACE_NAME,
};
pub use reconnect::{Backoff, BackoffConfig, BackoffError};
pub use session::{FailureFlag, PipeSession, PumpOptions};
pub use stats::TrafficStats;
pub use supervisor::{CycleState, Supervisor, SupervisorConfig};

use quictun_control::ControlError;
use quictun_transport::TransportError;
use std::fmt;
use thiserror::Error;

/// Where in the connection cycle a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Setup,
    Auth,
    Negotiation,
    Pump,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Setup => "setup",
            SessionPhase::Auth => "auth",
            SessionPhase::Negotiation => "negotiation",
            SessionPhase::Pump => "pump",
        };
        f.write_str(name)
    }
}

/// Anything that ends one connection cycle
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] ControlError),

    #[error("Pump failed: {0}")]
    Pump(String),
}

impl SessionError {
    pub fn phase(&self) -> SessionPhase {
        match self {
            SessionError::Interface(_) => SessionPhase::Setup,
            SessionError::Transport(
                TransportError::AuthenticationFailed(_) | TransportError::TlsError(_),
            ) => SessionPhase::Auth,
            SessionError::Transport(_) => SessionPhase::Setup,
            SessionError::Negotiation(_) => SessionPhase::Negotiation,
            SessionError::Pump(_) => SessionPhase::Pump,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_phases() {
        let err = SessionError::from(InterfaceError::CreateFailed {
            name: "tun17".to_string(),
            reason: "Operation not permitted".to_string(),
        });
        assert_eq!(err.phase(), SessionPhase::Setup);

        let err = SessionError::from(TransportError::AuthenticationFailed(
            "invalid cert name mallory != expected: client".to_string(),
        ));
        assert_eq!(err.phase(), SessionPhase::Auth);

        let err = SessionError::from(TransportError::ConnectionError("timed out".to_string()));
        assert_eq!(err.phase(), SessionPhase::Setup);

        let err = SessionError::from(ControlError::Rejected("10.54.0.0/24".to_string()));
        assert_eq!(err.phase(), SessionPhase::Negotiation);
        assert_eq!(err.phase().to_string(), "negotiation");

        assert_eq!(SessionError::Pump("eof".into()).phase(), SessionPhase::Pump);
    }
}
