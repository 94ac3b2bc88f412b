//! Two-phase route negotiation
//!
//! Each side announces its RouteSet with SUBNET_UPDATE and installs the
//! peer's routes on its own interface. Both sides share one control stream,
//! so the roles run the phases in opposite order: the server announces and
//! then serves, the client serves and then announces. Both phases always run
//! so the peer is never left waiting on a reply.

use crate::channel::ControlChannel;
use crate::{ControlError, ControlResult, Role};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use quictun_proto::{CommandType, ControlCommand, RouteSet};
use thiserror::Error;
use tracing::{error, info, warn};

/// A route could not be installed
#[derive(Debug, Error)]
#[error("Failed to add route {route}: {reason}")]
pub struct RouteApplyError {
    pub route: String,
    pub reason: String,
}

impl RouteApplyError {
    pub fn new(route: &IpNetwork, reason: impl Into<String>) -> Self {
        Self {
            route: route.to_string(),
            reason: reason.into(),
        }
    }
}

/// The local routing table, as far as negotiation needs it
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Route `network` through the tunnel interface
    async fn add_route(&self, network: &IpNetwork) -> Result<(), RouteApplyError>;
}

/// Send our routes and require an OK
pub async fn announce_routes(channel: &ControlChannel, routes: &RouteSet) -> ControlResult<()> {
    info!("Requesting to route [{}]", routes.encode());
    let reply = channel
        .request(&ControlCommand::subnet_update(routes).map_err(|e| {
            ControlError::Negotiation(format!("route list does not fit a command: {}", e))
        })?)
        .await?;

    if reply.is_ok() {
        info!("Peer accepted routes");
        Ok(())
    } else if reply.is_fail() {
        warn!("Peer didn't accept routes [{}]", routes.encode());
        Err(ControlError::Rejected(routes.encode()))
    } else {
        Err(ControlError::UnexpectedCommand {
            expected: CommandType::Ok,
            got: reply.kind(),
        })
    }
}

/// Serve the peer's announcement, installing every route it asks for
///
/// Stops at the first route that cannot be installed and replies FAIL.
pub async fn accept_routes<R>(channel: &ControlChannel, table: &R) -> ControlResult<()>
where
    R: RouteTable + ?Sized,
{
    let mut failure: Option<ControlError> = None;
    let slot = &mut failure;

    let reply = channel
        .serve(CommandType::SubnetUpdate, move |request| async move {
            let routes = match RouteSet::decode(request.payload()) {
                Ok(routes) => routes,
                Err(e) => {
                    warn!("Received invalid route request: {}", e);
                    *slot = Some(e.into());
                    return ControlCommand::fail();
                }
            };
            info!("Received route request: {}", routes);

            for route in &routes {
                if let Err(e) = table.add_route(route).await {
                    error!("Unable to add route {}: {}", route, e.reason);
                    *slot = Some(e.into());
                    return ControlCommand::fail();
                }
            }
            ControlCommand::ok()
        })
        .await?;

    match failure {
        Some(err) => Err(err),
        None if reply.is_ok() => Ok(()),
        None => Err(ControlError::Negotiation(format!("replied {}", reply.kind()))),
    }
}

/// Run both phases in the order `role` dictates
///
/// Fails if either phase failed; the session must not start in that case.
pub async fn negotiate<R>(
    channel: &ControlChannel,
    role: Role,
    routes: &RouteSet,
    table: &R,
) -> ControlResult<()>
where
    R: RouteTable + ?Sized,
{
    let (announced, accepted) = match role {
        Role::Server => {
            let announced = announce_routes(channel, routes).await;
            let accepted = accept_routes(channel, table).await;
            (announced, accepted)
        }
        Role::Client => {
            let accepted = accept_routes(channel, table).await;
            let announced = announce_routes(channel, routes).await;
            (announced, accepted)
        }
    };

    match (announced, accepted) {
        (Ok(()), Ok(())) => {
            info!("Routes setup complete");
            Ok(())
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(announce), Err(accept)) => Err(ControlError::Negotiation(format!(
            "announce: {}; accept: {}",
            announce, accept
        ))),
    }
}
