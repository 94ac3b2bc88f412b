//! quictun - VPN tunnel over mutually authenticated QUIC
//!
//! Bridges a TUN interface to a peer, exchanges routes with it and rebuilds
//! the whole session whenever it fails.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{RunArgs, SessionConfig};
use quictun_cert::{CertSet, CertSetParams};
use quictun_connection::{
    Connector, QuicClientConnector, QuicServerConnector, Supervisor, TunFactory,
};
use quictun_control::Role;
use quictun_transport_quic::Handshake;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("QUICTUN_VERSION");

/// quictun - route subnets between two hosts over QUIC
#[derive(Parser, Debug)]
#[command(name = "quictun")]
#[command(about = "quictun - route subnets between two hosts over QUIC")]
#[command(version = VERSION)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "QUICTUN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a tunnel endpoint
    #[command(long_about = r#"
Run one end of the tunnel. The server (-l) waits for a client on --bind,
the client dials --server. Both sides create the TUN interface, assign the
local address, exchange route requests and then forward packets until the
connection fails, at which point everything is rebuilt.

EXAMPLES:
  # Server
  quictun run -l -b 0.0.0.0:1234 --common-name client

  # Client asking the server to route two networks through the tunnel
  quictun run -s vpn.example.com:1234 -r "192.168.50.0/24;10.20.0.0/16"

ENVIRONMENT VARIABLES:
  Every flag can be set with QUICTUN_<FLAG>, e.g. QUICTUN_SERVER, QUICTUN_ROUTES
    "#)]
    Run(RunArgs),

    /// Generate a CA plus server and client certificates
    GenCerts {
        /// Output directory
        #[arg(short, long, default_value = ".")]
        out_dir: PathBuf,

        /// Common name of the CA
        #[arg(long, default_value = "quictun CA")]
        ca_name: String,

        /// Common name of the server certificate
        #[arg(long, default_value = "server")]
        server_name: String,

        /// Common name of the client certificate
        #[arg(long, default_value = "client")]
        client_name: String,

        /// Extra DNS name or IP for the server certificate (repeatable)
        #[arg(long = "alt-name")]
        alt_names: Vec<String>,
    },
}

/// RUST_LOG wins over --log-level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C");
    }

    info!("Shutting down...");
    cancel.cancel();
}

async fn run(args: RunArgs) -> Result<()> {
    let config = SessionConfig::from_args(args).context("Invalid configuration")?;
    config
        .quic
        .validate()
        .context("Invalid certificate configuration")?;

    info!("quictun {} starting (built {})", VERSION, env!("QUICTUN_BUILD_TIME"));
    info!(
        "Local address {}, announcing [{}]",
        config.local_address, config.routes
    );
    match &config.common_name {
        Some(name) => info!("Peer certificate must be issued to {}", name),
        None => warn!("Peer certificate common name is not checked"),
    }

    let handshake = Handshake::new(config.transport.clone(), config.common_name.clone());
    let connector: Arc<dyn Connector> = match config.role {
        Role::Server => {
            let bind = config
                .bind
                .context("Server mode requires a bind address")?;
            info!("Mode: Server, Bind: {}", bind);
            Arc::new(QuicServerConnector::new(
                bind,
                config.quic.clone(),
                handshake,
            ))
        }
        Role::Client => {
            let server = config
                .server
                .clone()
                .context("Client mode requires a server address")?;
            let addr = tokio::net::lookup_host(&server)
                .await
                .with_context(|| format!("Failed to resolve {}", server))?
                .next()
                .with_context(|| format!("No address found for {}", server))?;
            let server_name = config
                .server_name
                .clone()
                .unwrap_or_else(|| addr.ip().to_string());
            info!("Mode: Client, Target: {} ({}), TLS name {}", server, addr, server_name);
            Arc::new(QuicClientConnector::new(
                addr,
                server_name,
                config.quic.clone(),
                handshake,
            ))
        }
    };

    let interfaces = Arc::new(TunFactory::new(config.interface.clone()));
    let supervisor = Supervisor::new(config.supervisor_config(), interfaces, connector);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    if let Err(e) = supervisor.run(cancel).await {
        error!("Supervisor stopped: {}", e);
        return Err(e.into());
    }

    let stats = supervisor.stats();
    info!("quictun stopped ({})", stats);
    Ok(())
}

fn gen_certs(
    out_dir: PathBuf,
    ca_name: String,
    server_name: String,
    client_name: String,
    alt_names: Vec<String>,
) -> Result<()> {
    let params = CertSetParams {
        ca_name,
        server_name,
        client_name,
        server_alt_names: alt_names,
    };
    let paths = CertSet::generate(&params)
        .context("Failed to generate certificates")?
        .write_to_dir(&out_dir)
        .with_context(|| format!("Failed to write certificates to {}", out_dir.display()))?;

    info!("CA:     {} / {}", paths.ca_cert.display(), paths.ca_key.display());
    info!(
        "Server: {} / {}",
        paths.server_cert.display(),
        paths.server_key.display()
    );
    info!(
        "Client: {} / {}",
        paths.client_cert.display(),
        paths.client_key.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::GenCerts {
            out_dir,
            ca_name,
            server_name,
            client_name,
            alt_names,
        } => gen_certs(out_dir, ca_name, server_name, client_name, alt_names),
    }
}
