//! Command line entry point.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port
//! dpsrv
//!
//! # Listen on a specific address and port with TLS
//! dpsrv --listen 127.0.0.1 --port 27750 --ssl-cert cert.pem --ssl-key key.pem
//!
//! # Use a config file
//! dpsrv --config /etc/dpsrv.toml
//! DPSRV_CONFIG=/etc/dpsrv.toml dpsrv
//!
//! # Enable debug logging
//! RUST_LOG=dpsrvd=debug dpsrv
//! ```
//!
//! When started through socket activation the passed descriptor is used
//! instead of binding, and the server stops itself once idle.
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful stop (kick all users, wait for them to leave)

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dpsrv_core::{RecordingPattern, ServerConfig};

use crate::initsys;
use crate::registry::{SessionServer, StaticIdentities};
use crate::server::MultiServer;
use crate::status::StatusReporter;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DPSRV_CONFIG";

/// Collaborative drawing session server
#[derive(Parser, Debug)]
#[command(name = "dpsrv", version, about)]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    pub listen: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// TLS certificate chain (PEM)
    #[arg(long, requires = "ssl_key")]
    pub ssl_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "ssl_cert")]
    pub ssl_key: Option<PathBuf>,

    /// Refuse logins over unencrypted connections
    #[arg(long)]
    pub secure: bool,

    /// Stop once there are no sessions and no users left
    #[arg(long)]
    pub auto_stop: bool,

    /// Recording file name pattern (%d date, %t time, %i session id)
    #[arg(short, long)]
    pub record: Option<String>,

    /// Address advertised to the session listing server
    #[arg(long)]
    pub announce_local_addr: Option<String>,

    /// Random lag added to every incoming message, in milliseconds
    #[cfg(debug_assertions)]
    #[arg(long, default_value_t = 0)]
    pub lag: u64,
}

impl Args {
    /// Loads the config file (if any) and applies command line overrides.
    pub fn resolve_config(&self) -> Result<ServerConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => ServerConfig::load(&path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let (Some(cert), Some(key)) = (&self.ssl_cert, &self.ssl_key) {
            config.ssl_cert = Some(cert.clone());
            config.ssl_key = Some(key.clone());
        }
        config.must_secure |= self.secure;
        config.auto_stop |= self.auto_stop;
        if let Some(record) = &self.record {
            config.recording_path = RecordingPattern::new(record.clone());
        }
        if let Some(addr) = &self.announce_local_addr {
            config.announce_local_addr = Some(addr.clone());
        }

        Ok(config)
    }
}

/// Parses arguments and runs the server.
pub fn main() -> Result<()> {
    let args = Args::parse();
    run(args)
}

/// Runs the server (async entry point).
#[tokio::main]
async fn run(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("dpsrvd=info".parse()?)
                .add_directive("dpsrv_core=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "dpsrv starting"
    );

    let config = args.resolve_config()?;

    let mut server = MultiServer::new(
        Arc::new(config.clone()),
        SessionServer::new(),
        StatusReporter::new(initsys::status_sink()),
    );

    if let Some((cert, key)) = config.tls_files() {
        server.set_ssl_cert_files(cert, key);
    }
    server.set_must_secure(config.must_secure);
    if !config.users.is_empty() {
        server.set_identity_manager(Arc::new(StaticIdentities::new(config.users.clone())));
    }
    if let Some(addr) = &config.announce_local_addr {
        server.set_announce_local_addr(addr.clone());
    }
    #[cfg(debug_assertions)]
    if args.lag > 0 {
        server.set_random_lag(std::time::Duration::from_millis(args.lag));
    }

    let activation_fds = initsys::listen_fds();
    match activation_fds.first() {
        Some(&fd) => {
            server.set_auto_stop(true);
            server
                .start_fd(fd)
                .context("Failed to start on passed socket")?;
        }
        None => {
            server.set_auto_stop(config.auto_stop);
            server
                .start(config.port, config.listen)
                .await
                .context("Failed to start server")?;
        }
    }

    // Create cancellation token for graceful shutdown
    let stop_token = CancellationToken::new();

    let signal_token = stop_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    server.run(stop_token).await;

    info!("dpsrv stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
