//! Serialized request/reply exchanges over the control stream

use crate::{ControlError, ControlResult};
use quictun_proto::{CommandType, ControlCommand};
use quictun_transport::Transport;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Exclusive owner of a transport's control stream
///
/// Every exchange holds the channel lock from the first write or read until
/// the reply has gone out, so two exchanges never interleave on the wire.
pub struct ControlChannel {
    transport: Arc<dyn Transport>,
    exchange: Mutex<()>,
}

impl ControlChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            exchange: Mutex::new(()),
        }
    }

    /// Send `command` and wait for the peer's reply
    pub async fn request(&self, command: &ControlCommand) -> ControlResult<ControlCommand> {
        let _exchange = self.exchange.lock().await;

        debug!("Sending {}", command);
        self.transport.write_command(command).await?;

        let reply = self.transport.read_command().await?;
        debug!("Received reply {}", reply);
        Ok(reply)
    }

    /// Wait for one request of type `expected` and answer it with `handler`
    ///
    /// A request of any other type is answered with FAIL and reported as an
    /// error. Returns the reply that was sent.
    pub async fn serve<F, Fut>(
        &self,
        expected: CommandType,
        handler: F,
    ) -> ControlResult<ControlCommand>
    where
        F: FnOnce(ControlCommand) -> Fut + Send,
        Fut: Future<Output = ControlCommand> + Send,
    {
        let _exchange = self.exchange.lock().await;

        let request = self.transport.read_command().await?;
        if request.kind() != expected {
            warn!("Unexpected command {} (expected {})", request.kind(), expected);
            self.transport.write_command(&ControlCommand::fail()).await?;
            return Err(ControlError::UnexpectedCommand {
                expected,
                got: request.kind(),
            });
        }

        let reply = handler(request).await;
        debug!("Replying {}", reply);
        self.transport.write_command(&reply).await?;
        Ok(reply)
    }
}
