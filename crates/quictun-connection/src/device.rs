//! Virtual network interface and OS link configuration
//!
//! The session only needs a packet device it can read and write, plus a few
//! link operations: bring the link up, assign the local address and add
//! routes through the interface. The Linux implementations use a TUN device
//! and the `ip` command.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use quictun_control::{RouteApplyError, RouteTable};
use std::io;
use std::process::Output;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tun::AbstractDevice;

/// Interface name used when none is configured
pub const DEFAULT_INTERFACE_NAME: &str = "tun17";

const IP_COMMAND: &str = "ip";

/// Interface and link configuration errors
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("Failed to create interface {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// A packet device: every read yields one IP packet, every write sends one
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    fn name(&self) -> &str;

    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_packet(&self, packet: &[u8]) -> io::Result<usize>;
}

/// OS-level configuration of one interface
#[async_trait]
pub trait LinkControl: RouteTable {
    async fn bring_up(&self) -> Result<(), InterfaceError>;

    async fn assign_address(&self, address: &IpNetwork) -> Result<(), InterfaceError>;
}

/// A freshly created interface and the handle that configures it
pub struct OpenedInterface {
    pub device: Arc<dyn NetworkInterface>,
    pub link: Arc<dyn LinkControl>,
}

/// Creates the interface at the start of every session
///
/// Dropping the returned device must release the interface.
#[async_trait]
pub trait InterfaceFactory: Send + Sync {
    async fn open(&self) -> Result<OpenedInterface, InterfaceError>;
}

/// Linux TUN device
pub struct TunInterface {
    name: String,
    reader: Mutex<tun::DeviceReader>,
    writer: Mutex<tun::DeviceWriter>,
}

impl TunInterface {
    /// Create the TUN device `name`; the link stays down
    pub fn create(name: &str) -> Result<Self, InterfaceError> {
        let create_failed = |reason: String| InterfaceError::CreateFailed {
            name: name.to_string(),
            reason,
        };

        let mut config = tun::Configuration::default();
        #[allow(deprecated)]
        config.name(name);

        let device = tun::create_as_async(&config).map_err(|e| create_failed(e.to_string()))?;
        let actual_name = device
            .tun_name()
            .map_err(|e| create_failed(format!("unable to read device name: {}", e)))?;
        let (writer, reader) = device
            .split()
            .map_err(|e| create_failed(format!("unable to split device: {}", e)))?;

        info!("Created TUN device {}", actual_name);
        Ok(Self {
            name: actual_name,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl NetworkInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        self.writer.lock().await.write(packet).await
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        info!("Releasing TUN device {}", self.name);
    }
}

/// Link configuration through iproute2
#[derive(Debug, Clone)]
pub struct IpLinkControl {
    interface: String,
}

impl IpLinkControl {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<Output, InterfaceError> {
        let command = format!("{} {}", IP_COMMAND, args.join(" "));
        debug!("Running {}", command);
        Command::new(IP_COMMAND)
            .args(args)
            .output()
            .await
            .map_err(|source| InterfaceError::Spawn { command, source })
    }

    /// Run `ip args`, treating "already exists" as success
    async fn ip_idempotent(&self, args: &[&str]) -> Result<(), InterfaceError> {
        let output = self.ip(args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_already_exists_error(&stderr) {
            warn!(
                "ip {} already applied (treating as success): {}",
                args.join(" "),
                stderr
            );
            return Ok(());
        }
        Err(InterfaceError::CommandFailed {
            command: format!("{} {}", IP_COMMAND, args.join(" ")),
            stderr,
        })
    }
}

#[async_trait]
impl RouteTable for IpLinkControl {
    async fn add_route(&self, network: &IpNetwork) -> Result<(), RouteApplyError> {
        let network = network.to_string();
        self.ip_idempotent(&["route", "add", &network, "dev", &self.interface])
            .await
            .map_err(|e| RouteApplyError {
                route: network.clone(),
                reason: e.to_string(),
            })?;
        info!("Added route {} via {}", network, self.interface);
        Ok(())
    }
}

#[async_trait]
impl LinkControl for IpLinkControl {
    async fn bring_up(&self) -> Result<(), InterfaceError> {
        self.ip_idempotent(&["link", "set", "dev", &self.interface, "up"])
            .await?;
        info!("Link {} is up", self.interface);
        Ok(())
    }

    async fn assign_address(&self, address: &IpNetwork) -> Result<(), InterfaceError> {
        let address = address.to_string();
        self.ip_idempotent(&["addr", "add", &address, "dev", &self.interface])
            .await?;
        info!("Assigned {} to {}", address, self.interface);
        Ok(())
    }
}

/// Opens a TUN device and an `ip` link controller for it
#[derive(Debug, Clone)]
pub struct TunFactory {
    name: String,
}

impl TunFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl InterfaceFactory for TunFactory {
    async fn open(&self) -> Result<OpenedInterface, InterfaceError> {
        let device = TunInterface::create(&self.name)?;
        let link = IpLinkControl::new(device.name());
        Ok(OpenedInterface {
            device: Arc::new(device),
            link: Arc::new(link),
        })
    }
}

/// iproute2 reports "RTNETLINK answers: File exists" for duplicate routes
/// and addresses
fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists") || lower.contains("eexist")
}
