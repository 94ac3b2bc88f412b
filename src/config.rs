//! Command-line configuration for a tunnel endpoint
//!
//! Flags fall back to `QUICTUN_*` environment variables. Everything is
//! checked once at startup; a bad configuration stops the process.

use anyhow::{bail, Context, Result};
use clap::Args;
use ipnetwork::IpNetwork;
use quictun_connection::{SupervisorConfig, DEFAULT_INTERFACE_NAME};
use quictun_control::Role;
use quictun_proto::RouteSet;
use quictun_transport::TransportOptions;
use quictun_transport_quic::QuicConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER_LADDR: &str = "10.54.0.10/24";
const DEFAULT_CLIENT_LADDR: &str = "10.54.0.11/24";

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Run as server and wait for a client
    #[arg(short = 'l', long, env = "QUICTUN_LISTEN")]
    pub listen: bool,

    /// Server bind address (e.g., 0.0.0.0:1234)
    #[arg(short = 'b', long, env = "QUICTUN_BIND")]
    pub bind: Option<SocketAddr>,

    /// Server to connect to (host:port)
    #[arg(short = 's', long, env = "QUICTUN_SERVER")]
    pub server: Option<String>,

    /// Local address in CIDR notation (default 10.54.0.10/24 server, 10.54.0.11/24 client)
    #[arg(long, env = "QUICTUN_LADDR")]
    pub laddr: Option<String>,

    /// Networks the peer should route to us, as cidr;cidr;...
    #[arg(short = 'r', long, env = "QUICTUN_ROUTES", default_value = "")]
    pub routes: String,

    /// Required common name of the peer certificate (no check when unset)
    #[arg(long, env = "QUICTUN_COMMON_NAME")]
    pub common_name: Option<String>,

    /// Name of the TUN interface
    #[arg(long, env = "QUICTUN_INTERFACE", default_value = DEFAULT_INTERFACE_NAME)]
    pub interface: String,

    /// Certificate (default server.pem or client.pem)
    #[arg(long, env = "QUICTUN_CERT")]
    pub cert: Option<PathBuf>,

    /// Private key (default server.key or client.key)
    #[arg(long, env = "QUICTUN_KEY")]
    pub key: Option<PathBuf>,

    /// Trusted CA certificate
    #[arg(long, env = "QUICTUN_CA", default_value = "ca.pem")]
    pub ca: PathBuf,

    /// TLS name of the server (default: host part of --server)
    #[arg(long, env = "QUICTUN_SERVER_NAME")]
    pub server_name: Option<String>,

    /// Number of parallel data streams
    #[arg(long, env = "QUICTUN_STREAMS", default_value = "30")]
    pub streams: usize,

    /// Seconds to wait before rebuilding a failed session
    #[arg(long, env = "QUICTUN_RETRY_DELAY_SECS", default_value = "3")]
    pub retry_delay_secs: u64,

    /// Seconds between QUIC keep-alive packets
    #[arg(long, env = "QUICTUN_KEEP_ALIVE_SECS", default_value = "3")]
    pub keep_alive_secs: u64,

    /// Seconds of silence after which the QUIC connection is considered dead
    #[arg(long, env = "QUICTUN_IDLE_TIMEOUT_SECS", default_value = "10")]
    pub idle_timeout_secs: u64,

    /// Seconds between statistics log lines
    #[arg(long, env = "QUICTUN_STATS_INTERVAL_SECS", default_value = "10")]
    pub stats_interval_secs: u64,
}

/// Validated endpoint configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub bind: Option<SocketAddr>,
    pub server: Option<String>,
    pub server_name: Option<String>,
    pub local_address: IpNetwork,
    pub routes: RouteSet,
    pub common_name: Option<String>,
    pub interface: String,
    pub quic: QuicConfig,
    pub transport: TransportOptions,
    pub retry_delay: Duration,
    pub stats_interval: Duration,
}

impl SessionConfig {
    pub fn from_args(args: RunArgs) -> Result<Self> {
        let role = if args.listen {
            Role::Server
        } else {
            Role::Client
        };

        let default_laddr = match role {
            Role::Server => DEFAULT_SERVER_LADDR,
            Role::Client => DEFAULT_CLIENT_LADDR,
        };
        let laddr = args
            .laddr
            .clone()
            .unwrap_or_else(|| default_laddr.to_string());
        let local_address: IpNetwork = laddr
            .parse()
            .with_context(|| format!("Invalid local address {:?}, expected CIDR", laddr))?;
        let routes = RouteSet::for_local_address(&laddr, &args.routes)
            .with_context(|| format!("Invalid route list {:?}", args.routes))?;

        let (default_cert, default_key) = match role {
            Role::Server => ("server.pem", "server.key"),
            Role::Client => ("client.pem", "client.key"),
        };
        // Data streams plus the control stream must fit the peer's stream limit
        let quic = QuicConfig::new(
            args.cert.unwrap_or_else(|| PathBuf::from(default_cert)),
            args.key.unwrap_or_else(|| PathBuf::from(default_key)),
            args.ca,
        )
        .with_keep_alive(Duration::from_secs(args.keep_alive_secs))
        .with_idle_timeout(Duration::from_secs(args.idle_timeout_secs))
        .with_max_streams((args.streams as u64 + 1).max(100));

        let server_name = args
            .server_name
            .or_else(|| args.server.as_deref().map(host_part));

        let config = Self {
            role,
            bind: args.bind,
            server: args.server,
            server_name,
            local_address,
            routes,
            common_name: args.common_name.filter(|name| !name.is_empty()),
            interface: args.interface,
            quic,
            transport: TransportOptions {
                streams: args.streams,
                ..Default::default()
            },
            retry_delay: Duration::from_secs(args.retry_delay_secs),
            stats_interval: Duration::from_secs(args.stats_interval_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory mode flags and unusable settings
    pub fn validate(&self) -> Result<()> {
        match self.role {
            Role::Server => {
                if self.bind.is_none() {
                    bail!("Server mode requires a bind address via --bind");
                }
                if self.server.is_some() {
                    bail!("Server mode can't accept a server address via --server");
                }
            }
            Role::Client => {
                if self.bind.is_some() {
                    bail!("Client mode can't accept a bind address via --bind");
                }
                if self.server.is_none() {
                    bail!("Client mode requires a server address via --server");
                }
            }
        }

        if self.interface.is_empty() {
            bail!("Interface name must not be empty");
        }
        self.transport
            .validate()
            .context("Invalid transport options")?;
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = SupervisorConfig::new(self.role, self.local_address, self.routes.clone());
        config.retry_delay = self.retry_delay;
        config.pump.stats_interval = self.stats_interval;
        config.pump.buffer_size = self.transport.max_payload();
        config
    }
}

/// "vpn.example.com:1234" -> "vpn.example.com", "[::1]:1234" -> "::1"
fn host_part(address: &str) -> String {
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> RunArgs {
        let mut argv = vec!["quictun"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).run
    }

    #[test]
    fn test_server_defaults() {
        let config = SessionConfig::from_args(parse(&["-l", "-b", "0.0.0.0:1234"])).unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.local_address.to_string(), "10.54.0.10/24");
        assert_eq!(config.routes.encode(), "10.54.0.0/24");
        assert_eq!(config.quic.cert_path, PathBuf::from("server.pem"));
        assert_eq!(config.quic.key_path, PathBuf::from("server.key"));
        assert_eq!(config.quic.ca_path, PathBuf::from("ca.pem"));
        assert_eq!(config.interface, "tun17");
        assert_eq!(config.transport.streams, 30);
        assert_eq!(config.quic.keep_alive_interval, Duration::from_secs(3));
        assert_eq!(config.quic.max_idle_timeout, Duration::from_secs(10));
        assert_eq!(config.quic.max_concurrent_streams, 100);
        assert!(config.common_name.is_none());
    }

    #[test]
    fn test_client_with_routes() {
        let config = SessionConfig::from_args(parse(&[
            "-s",
            "vpn.example.com:1234",
            "--laddr",
            "10.1.0.11/24",
            "-r",
            "192.168.44.7/32; 10.0.0.0/8;;",
            "--common-name",
            "server",
        ]))
        .unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(
            config.routes.encode(),
            "10.1.0.0/24;192.168.44.7/32;10.0.0.0/8"
        );
        assert_eq!(config.server_name.as_deref(), Some("vpn.example.com"));
        assert_eq!(config.quic.cert_path, PathBuf::from("client.pem"));
        assert_eq!(config.common_name.as_deref(), Some("server"));
    }

    #[test]
    fn test_mode_flags_are_exclusive() {
        assert!(SessionConfig::from_args(parse(&["-l"])).is_err());
        assert!(SessionConfig::from_args(parse(&[
            "-l",
            "-b",
            "0.0.0.0:1234",
            "-s",
            "10.0.0.1:1234"
        ]))
        .is_err());
        assert!(SessionConfig::from_args(parse(&[])).is_err());
        assert!(SessionConfig::from_args(parse(&["-b", "0.0.0.0:1234", "-s", "h:1"])).is_err());
    }

    #[test]
    fn test_invalid_addresses_are_fatal() {
        assert!(SessionConfig::from_args(parse(&["-s", "h:1", "--laddr", "10.54.0.11"])).is_ok());
        assert!(SessionConfig::from_args(parse(&["-s", "h:1", "--laddr", "not-an-ip"])).is_err());
        assert!(SessionConfig::from_args(parse(&["-s", "h:1", "-r", "10.0.0.0/33"])).is_err());
        assert!(SessionConfig::from_args(parse(&["-s", "h:1", "--streams", "0"])).is_err());
    }

    #[test]
    fn test_quic_tuning_flags() {
        let config = SessionConfig::from_args(parse(&[
            "-s",
            "h:1",
            "--streams",
            "150",
            "--keep-alive-secs",
            "5",
            "--idle-timeout-secs",
            "30",
        ]))
        .unwrap();
        assert_eq!(config.quic.keep_alive_interval, Duration::from_secs(5));
        assert_eq!(config.quic.max_idle_timeout, Duration::from_secs(30));
        assert_eq!(config.quic.max_concurrent_streams, 151);
    }

    #[test]
    fn test_pump_buffer_matches_transport_payload() {
        let config = SessionConfig::from_args(parse(&["-s", "h:1"])).unwrap();
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.pump.buffer_size, config.transport.max_payload());
        assert_eq!(supervisor.pump.buffer_size, 4094);
    }

    #[test]
    fn test_host_part() {
        assert_eq!(host_part("vpn.example.com:1234"), "vpn.example.com");
        assert_eq!(host_part("[::1]:1234"), "::1");
        assert_eq!(host_part("localhost"), "localhost");
    }
}
