//! Reconnect supervisor
//!
//! Each cycle walks SETUP -> NEGOTIATING -> RUNNING -> CLOSING and then
//! starts over from a fresh interface and transport until shutdown.

use crate::connector::Connector;
use crate::device::{InterfaceFactory, OpenedInterface};
use crate::reconnect::{Backoff, BackoffConfig, BackoffError};
use crate::session::{PipeSession, PumpOptions};
use crate::stats::TrafficStats;
use crate::{SessionError, SessionPhase};
use ipnetwork::IpNetwork;
use quictun_control::Role;
use quictun_proto::RouteSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub role: Role,
    /// Address assigned to the interface, with its prefix
    pub local_address: IpNetwork,
    /// Routes announced to the peer
    pub routes: RouteSet,
    /// Pause after a session that got past setup and then failed
    pub retry_delay: Duration,
    /// Backoff between failed setups
    pub backoff: BackoffConfig,
    pub pump: PumpOptions,
}

impl SupervisorConfig {
    pub fn new(role: Role, local_address: IpNetwork, routes: RouteSet) -> Self {
        Self {
            role,
            local_address,
            routes,
            retry_delay: Duration::from_secs(3),
            backoff: BackoffConfig::default(),
            pump: PumpOptions::default(),
        }
    }
}

/// States of one connection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Setup,
    Negotiating,
    Running,
    Closing,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Setup => "SETUP",
            CycleState::Negotiating => "NEGOTIATING",
            CycleState::Running => "RUNNING",
            CycleState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    interfaces: Arc<dyn InterfaceFactory>,
    connector: Arc<dyn Connector>,
    stats: Arc<TrafficStats>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        interfaces: Arc<dyn InterfaceFactory>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            interfaces,
            connector,
            stats: Arc::new(TrafficStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        self.stats.clone()
    }

    /// Run connection cycles until `cancel` fires
    ///
    /// Only an exhausted setup backoff ends the loop with an error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BackoffError> {
        let role = self.config.role;
        info!(%role, "Supervisor started, routes [{}]", self.config.routes);
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            if cancel.is_cancelled() {
                info!(%role, "Shutdown requested, supervisor exiting");
                return Ok(());
            }

            match self.run_cycle(&cancel).await {
                Ok(()) => {
                    backoff.reset();
                    info!(%role, "Service loop ended");
                }
                Err(e) => {
                    let phase = e.phase();
                    error!(%role, %phase, "Session failed: {}", e);

                    match phase {
                        SessionPhase::Setup | SessionPhase::Auth => {
                            match backoff.wait(&cancel).await {
                                Ok(()) => {}
                                Err(BackoffError::Cancelled) => continue,
                                Err(e) => return Err(e),
                            }
                        }
                        SessionPhase::Negotiation => {
                            backoff.reset();
                            self.pause(&cancel).await;
                        }
                        SessionPhase::Pump => {
                            backoff.reset();
                            if !role.is_server() {
                                self.pause(&cancel).await;
                            }
                        }
                    }
                }
            }

            if !cancel.is_cancelled() {
                let count = self.stats.record_reconnect();
                info!(%role, "Restarting session (reconnect #{})", count);
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        debug!("Retrying in {:?}", self.config.retry_delay);
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.retry_delay) => {}
        }
    }

    /// One full cycle; Ok means it ended without a failure (shutdown)
    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let role = self.config.role;
        transition(role, CycleState::Setup);

        let interface = self.open_interface().await?;
        let transport = tokio::select! {
            _ = cancel.cancelled() => {
                info!(%role, "Shutdown requested during setup");
                return Ok(());
            }
            transport = self.connector.establish() => transport?,
        };

        let session = PipeSession::new(
            interface.device.clone(),
            transport,
            self.config.routes.clone(),
            self.stats.clone(),
            self.config.pump.clone(),
        );

        transition(role, CycleState::Negotiating);
        let negotiated = tokio::select! {
            _ = cancel.cancelled() => None,
            result = session.negotiate(role, interface.link.as_ref()) => Some(result),
        };
        let result = match negotiated {
            None => Ok(()),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(())) => {
                transition(role, CycleState::Running);
                session.run(cancel).await
            }
        };

        transition(role, CycleState::Closing);
        session.close().await;
        info!(%role, "Releasing interface {}", interface.device.name());
        drop(session);
        drop(interface);
        result
    }

    async fn open_interface(&self) -> Result<OpenedInterface, SessionError> {
        let interface = self.interfaces.open().await?;
        interface.link.bring_up().await?;
        interface
            .link
            .assign_address(&self.config.local_address)
            .await?;
        Ok(interface)
    }
}

fn transition(role: Role, state: CycleState) {
    info!(%role, "Session state: {}", state);
}
